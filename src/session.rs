//! Problem session state machine.
//!
//! ```text
//! NotStarted --start--> Started --expire--> Expired --start--> Started
//!                          |  \--submit--> Waiting --cooldown clears--> Started
//!                          \ (host reports solved at load) --> Solved (terminal)
//! ```
//!
//! Remaining time is always derived from the persisted start instant, so a
//! reload resumes the window where it was instead of granting a fresh 5:00.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::clock::Clock;
use crate::runtime::Ticker;
use crate::signals::{CooldownProbe, SolvedProbe};
use crate::store::{ProblemStore, START_KEY};

/// Length of one solve window
pub const SOLVE_WINDOW_SECS: u64 = 300;
/// Countdown refresh interval
pub const COUNTDOWN_TICK: Duration = Duration::from_secs(1);
/// How often the host cooldown signal is polled while waiting
pub const COOLDOWN_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum SessionState {
    NotStarted,
    Started,
    Waiting,
    Expired,
    Solved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Tick { remaining: u64 },
    Expired,
    CooldownCleared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("This problem is already solved.")]
    Solved,
    #[error("Please wait for the submission cooldown (about 50s) to pass.")]
    CoolingDown,
    #[error("Start the problem first; no solve window is open.")]
    NotStarted,
}

/// Seconds left in a window opened at `start`, clamped to `0..=SOLVE_WINDOW_SECS`
pub fn remaining_at(start: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let elapsed_secs = (now - start).num_milliseconds().div_euclid(1000);
    let window = SOLVE_WINDOW_SECS as i64;
    (window - elapsed_secs).clamp(0, window) as u64
}

pub struct ProblemSession {
    state: SessionState,
    start: Option<DateTime<Utc>>,
    store: ProblemStore,
    clock: Arc<dyn Clock>,
    countdown: Ticker,
    cooldown: Ticker,
}

impl std::fmt::Debug for ProblemSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProblemSession")
            .field("state", &self.state)
            .field("start", &self.start)
            .field("countdown", &self.countdown)
            .field("cooldown", &self.cooldown)
            .finish_non_exhaustive()
    }
}

impl ProblemSession {
    /// Rebuild the session from persisted state and the host signals
    pub fn load(
        store: ProblemStore,
        clock: Arc<dyn Clock>,
        solved: &dyn SolvedProbe,
        cooldown: &dyn CooldownProbe,
    ) -> Self {
        let now = clock.now();
        let start = store.get::<DateTime<Utc>>(&[START_KEY]);
        let mut session = Self {
            state: SessionState::NotStarted,
            start,
            store,
            clock,
            countdown: Ticker::new(COUNTDOWN_TICK),
            cooldown: Ticker::new(COOLDOWN_POLL),
        };

        if solved.is_solved() {
            session.state = SessionState::Solved;
        } else if cooldown.is_active() {
            session.enter_waiting(now);
        } else if let Some(start) = start {
            if remaining_at(start, now) > 0 {
                session.enter_started(now);
            } else {
                session.expire();
            }
        }

        info!(state = %session.state, remaining = ?session.remaining_secs(), "session loaded");
        session
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.start
    }

    /// Seconds left while a window is open
    pub fn remaining_secs(&self) -> Option<u64> {
        match (self.state, self.start) {
            (SessionState::Started, Some(start)) => Some(remaining_at(start, self.clock.now())),
            _ => None,
        }
    }

    pub fn countdown_running(&self) -> bool {
        self.countdown.is_running()
    }

    pub fn cooldown_polling(&self) -> bool {
        self.cooldown.is_running()
    }

    pub fn is_solved(&self) -> bool {
        self.state == SessionState::Solved
    }

    /// Editing, running and submitting are only legal inside an open window
    pub fn can_edit(&self) -> bool {
        self.state == SessionState::Started && self.remaining_secs() != Some(0)
    }

    pub fn can_start(&self) -> bool {
        matches!(self.state, SessionState::NotStarted | SessionState::Expired)
    }

    /// Open a solve window; calling it while one is open resumes that window
    pub fn start(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Solved => Err(SessionError::Solved),
            SessionState::Waiting => Err(SessionError::CoolingDown),
            SessionState::Started => Ok(()),
            SessionState::NotStarted | SessionState::Expired => {
                let now = self.clock.now();
                self.open_window(now);
                Ok(())
            }
        }
    }

    /// Close the window after a hand-in and wait for the host cooldown
    pub fn mark_submitted(&mut self) -> Result<(), SessionError> {
        self.require_open()?;
        let now = self.clock.now();
        self.clear_start();
        self.enter_waiting(now);
        Ok(())
    }

    /// Fails, expiring the session on the way, unless a window is open right now
    pub fn require_open(&mut self) -> Result<(), SessionError> {
        self.expire_if_due();
        match self.state {
            SessionState::Started => Ok(()),
            SessionState::Solved => Err(SessionError::Solved),
            SessionState::Waiting => Err(SessionError::CoolingDown),
            SessionState::NotStarted | SessionState::Expired => Err(SessionError::NotStarted),
        }
    }

    /// Expire an open window whose time is up; true when this call closed it
    pub fn expire_if_due(&mut self) -> bool {
        if self.state == SessionState::Started && self.remaining_secs() == Some(0) {
            self.expire();
            true
        } else {
            false
        }
    }

    /// Advance both timers; `probe` is consulted once per cooldown poll
    pub fn tick(&mut self, probe: &dyn CooldownProbe) -> Vec<SessionEvent> {
        let now = self.clock.now();
        let mut events = Vec::new();

        if self.state == SessionState::Started && self.countdown.poll(now) {
            let remaining = self.start.map(|start| remaining_at(start, now)).unwrap_or(0);
            if remaining == 0 {
                self.expire();
                events.push(SessionEvent::Expired);
            } else {
                events.push(SessionEvent::Tick { remaining });
            }
        }

        if self.state == SessionState::Waiting && self.cooldown.poll(now) && !probe.is_active() {
            match self.start {
                Some(start) if remaining_at(start, now) > 0 => self.enter_started(now),
                _ => self.open_window(now),
            }
            info!("cooldown cleared");
            events.push(SessionEvent::CooldownCleared);
        }

        events
    }

    fn open_window(&mut self, now: DateTime<Utc>) {
        self.start = Some(now);
        self.store.save(&[START_KEY], &now);
        self.enter_started(now);
        info!(start = %now, "solve window opened");
    }

    fn enter_started(&mut self, now: DateTime<Utc>) {
        self.state = SessionState::Started;
        self.cooldown.stop();
        self.countdown.start(now);
    }

    fn enter_waiting(&mut self, now: DateTime<Utc>) {
        self.state = SessionState::Waiting;
        self.countdown.stop();
        self.cooldown.start(now);
        info!("waiting for the submission cooldown");
    }

    fn expire(&mut self) {
        self.countdown.stop();
        self.clear_start();
        self.state = SessionState::Expired;
        info!("solve window expired");
    }

    fn clear_start(&mut self) {
        self.start = None;
        self.store.remove(&[START_KEY]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::signals::NoSignal;
    use chrono::TimeZone;
    use std::cell::Cell;

    struct Solved;

    impl SolvedProbe for Solved {
        fn is_solved(&self) -> bool {
            true
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    fn fresh(clock: &ManualClock, store: &ProblemStore) -> ProblemSession {
        ProblemSession::load(store.clone(), Arc::new(clock.clone()), &NoSignal, &NoSignal)
    }

    #[test]
    fn remaining_floors_elapsed_seconds() {
        let start = t0();
        assert_eq!(remaining_at(start, start), 300);
        assert_eq!(remaining_at(start, start + chrono::Duration::milliseconds(999)), 300);
        assert_eq!(remaining_at(start, start + chrono::Duration::milliseconds(1000)), 299);
        assert_eq!(remaining_at(start, start + secs(300)), 0);
        assert_eq!(remaining_at(start, start + secs(1000)), 0);
        assert_eq!(remaining_at(start, start - secs(30)), 300);
    }

    #[test]
    fn new_session_is_not_started() {
        let clock = ManualClock::new(t0());
        let session = fresh(&clock, &ProblemStore::in_memory("dna"));
        assert_eq!(session.state(), SessionState::NotStarted);
        assert_eq!(session.remaining_secs(), None);
        assert!(!session.countdown_running());
        assert!(!session.can_edit());
        assert!(session.can_start());
    }

    #[test]
    fn start_persists_timestamp_and_runs_countdown() {
        let clock = ManualClock::new(t0());
        let store = ProblemStore::in_memory("dna");
        let mut session = fresh(&clock, &store);

        session.start().unwrap();
        assert_eq!(session.state(), SessionState::Started);
        assert_eq!(session.remaining_secs(), Some(300));
        assert!(session.countdown_running());
        assert_eq!(store.get::<DateTime<Utc>>(&[START_KEY]), Some(t0()));
    }

    #[test]
    fn reload_resumes_with_reduced_time() {
        let clock = ManualClock::new(t0());
        let store = ProblemStore::in_memory("dna");
        fresh(&clock, &store).start().unwrap();

        clock.advance(secs(120));
        let session = fresh(&clock, &store);
        assert_eq!(session.state(), SessionState::Started);
        assert_eq!(session.remaining_secs(), Some(180));
        assert!(session.countdown_running());
    }

    #[test]
    fn reload_after_window_expires_clears_start() {
        let clock = ManualClock::new(t0());
        let store = ProblemStore::in_memory("dna");
        fresh(&clock, &store).start().unwrap();

        clock.advance(secs(300));
        let session = fresh(&clock, &store);
        assert_eq!(session.state(), SessionState::Expired);
        assert!(session.started_at().is_none());
        assert!(store.get::<DateTime<Utc>>(&[START_KEY]).is_none());
        assert!(!session.can_edit());
    }

    #[test]
    fn restart_while_open_resumes_the_same_window() {
        let clock = ManualClock::new(t0());
        let mut session = fresh(&clock, &ProblemStore::in_memory("dna"));
        session.start().unwrap();
        clock.advance(secs(40));
        session.start().unwrap();
        assert_eq!(session.started_at(), Some(t0()));
        assert_eq!(session.remaining_secs(), Some(260));
    }

    #[test]
    fn countdown_ticks_then_expires() {
        let clock = ManualClock::new(t0());
        let store = ProblemStore::in_memory("dna");
        let mut session = fresh(&clock, &store);
        session.start().unwrap();

        clock.advance(secs(1));
        assert_eq!(
            session.tick(&NoSignal),
            vec![SessionEvent::Tick { remaining: 299 }]
        );

        clock.advance(secs(299));
        assert_eq!(session.tick(&NoSignal), vec![SessionEvent::Expired]);
        assert_eq!(session.state(), SessionState::Expired);
        assert!(!session.countdown_running());
        assert!(store.get::<DateTime<Utc>>(&[START_KEY]).is_none());
        assert!(session.tick(&NoSignal).is_empty());
    }

    #[test]
    fn deadline_closes_editing_before_the_next_tick() {
        let clock = ManualClock::new(t0());
        let store = ProblemStore::in_memory("dna");
        let mut session = fresh(&clock, &store);
        session.start().unwrap();
        assert!(!session.expire_if_due());

        clock.advance(secs(300));
        assert_eq!(session.state(), SessionState::Started);
        assert!(!session.can_edit());
        assert!(session.expire_if_due());
        assert_eq!(session.state(), SessionState::Expired);
        assert!(!session.expire_if_due());
        assert_eq!(store.get::<DateTime<Utc>>(&[START_KEY]), None);
    }

    #[test]
    fn expired_session_can_be_restarted() {
        let clock = ManualClock::new(t0());
        let mut session = fresh(&clock, &ProblemStore::in_memory("dna"));
        session.start().unwrap();
        clock.advance(secs(301));
        assert_eq!(session.require_open(), Err(SessionError::NotStarted));
        assert_eq!(session.state(), SessionState::Expired);

        session.start().unwrap();
        assert_eq!(session.remaining_secs(), Some(300));
    }

    #[test]
    fn submission_enters_waiting_until_probe_clears() {
        let clock = ManualClock::new(t0());
        let store = ProblemStore::in_memory("dna");
        let mut session = fresh(&clock, &store);
        session.start().unwrap();
        session.mark_submitted().unwrap();

        assert_eq!(session.state(), SessionState::Waiting);
        assert!(!session.countdown_running());
        assert!(session.cooldown_polling());
        assert!(store.get::<DateTime<Utc>>(&[START_KEY]).is_none());
        assert_eq!(session.start(), Err(SessionError::CoolingDown));

        let active = Cell::new(true);
        let probe = || active.get();
        clock.advance(secs(1));
        assert!(session.tick(&probe).is_empty());
        assert_eq!(session.state(), SessionState::Waiting);

        active.set(false);
        clock.advance(secs(1));
        assert_eq!(session.tick(&probe), vec![SessionEvent::CooldownCleared]);
        assert_eq!(session.state(), SessionState::Started);
        assert_eq!(session.remaining_secs(), Some(300));
        assert!(!session.cooldown_polling());
    }

    #[test]
    fn cooldown_is_polled_once_per_second() {
        let clock = ManualClock::new(t0());
        let mut session = fresh(&clock, &ProblemStore::in_memory("dna"));
        session.start().unwrap();
        session.mark_submitted().unwrap();

        let polls = Cell::new(0);
        let probe = || {
            polls.set(polls.get() + 1);
            true
        };
        session.tick(&probe);
        clock.advance(chrono::Duration::milliseconds(500));
        session.tick(&probe);
        assert_eq!(polls.get(), 0);
        clock.advance(chrono::Duration::milliseconds(500));
        session.tick(&probe);
        session.tick(&probe);
        assert_eq!(polls.get(), 1);
    }

    #[test]
    fn cooldown_at_load_resumes_a_still_open_window() {
        let clock = ManualClock::new(t0());
        let store = ProblemStore::in_memory("dna");
        store.save(&[START_KEY], &t0());
        clock.advance(secs(60));

        let mut session =
            ProblemSession::load(store.clone(), Arc::new(clock.clone()), &NoSignal, &|| true);
        assert_eq!(session.state(), SessionState::Waiting);

        clock.advance(secs(1));
        session.tick(&NoSignal);
        assert_eq!(session.state(), SessionState::Started);
        assert_eq!(session.remaining_secs(), Some(239));
    }

    #[test]
    fn solved_at_load_is_terminal() {
        let clock = ManualClock::new(t0());
        let store = ProblemStore::in_memory("dna");
        let mut session =
            ProblemSession::load(store, Arc::new(clock.clone()), &Solved, &|| true);

        assert_eq!(session.state(), SessionState::Solved);
        assert_eq!(session.start(), Err(SessionError::Solved));
        assert_eq!(session.mark_submitted(), Err(SessionError::Solved));
        clock.advance(secs(10));
        assert!(session.tick(&NoSignal).is_empty());
        assert!(session.is_solved());
        assert!(!session.can_start());
    }

    #[test]
    fn submission_outside_window_is_refused() {
        let clock = ManualClock::new(t0());
        let mut session = fresh(&clock, &ProblemStore::in_memory("dna"));
        assert_eq!(session.mark_submitted(), Err(SessionError::NotStarted));

        session.start().unwrap();
        clock.advance(secs(300));
        assert_eq!(session.mark_submitted(), Err(SessionError::NotStarted));
        assert_eq!(session.state(), SessionState::Expired);
    }
}
