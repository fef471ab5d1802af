use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossterm::event::{self, Event as CtEvent, KeyEvent};

use crate::backend::{Output, RunOutput};

/// Unified event type consumed by the app runner
#[derive(Clone, Debug)]
pub enum AppEvent {
    Key(KeyEvent),
    Resize,
    Tick,
    /// One line produced by an in-flight run
    Output(Output),
    /// The in-flight run has been drained; `aborted` when the worker died mid-run
    RunFinished { aborted: bool },
}

/// Source of terminal and worker events
pub trait AppEventSource: Send + 'static {
    /// Block for up to `timeout` waiting for an event.
    /// Returns Ok(event) if an event arrives before the timeout, or Err(Timeout) if it expires.
    fn recv_timeout(&self, timeout: Duration) -> Result<AppEvent, RecvTimeoutError>;
}

/// Production event source using crossterm
pub struct CrosstermEventSource {
    tx: Sender<AppEvent>,
    rx: Receiver<AppEvent>,
}

impl CrosstermEventSource {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        let input_tx = tx.clone();

        thread::spawn(move || loop {
            let forwarded = match event::read() {
                Ok(CtEvent::Key(key)) => input_tx.send(AppEvent::Key(key)),
                Ok(CtEvent::Resize(_, _)) => input_tx.send(AppEvent::Resize),
                Ok(_) => Ok(()),
                Err(_) => break,
            };
            if forwarded.is_err() {
                break;
            }
        });

        Self { tx, rx }
    }

    /// Handle for worker threads that feed run output back into the loop
    pub fn sender(&self) -> Sender<AppEvent> {
        self.tx.clone()
    }
}

impl Default for CrosstermEventSource {
    fn default() -> Self {
        Self::new()
    }
}

impl AppEventSource for CrosstermEventSource {
    fn recv_timeout(&self, timeout: Duration) -> Result<AppEvent, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }
}

/// Test event source for unit tests
pub struct TestEventSource {
    rx: Receiver<AppEvent>,
}

impl TestEventSource {
    pub fn new(rx: Receiver<AppEvent>) -> Self {
        Self { rx }
    }
}

impl AppEventSource for TestEventSource {
    fn recv_timeout(&self, timeout: Duration) -> Result<AppEvent, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }
}

/// Runner that advances the application one event/tick at a time
pub struct Runner<E: AppEventSource> {
    event_source: E,
    frame: Duration,
}

impl<E: AppEventSource> Runner<E> {
    pub fn new(event_source: E, frame: Duration) -> Self {
        Self {
            event_source,
            frame,
        }
    }

    /// Blocks up to one frame and returns the next event, or Tick on timeout
    pub fn step(&self) -> AppEvent {
        match self.event_source.recv_timeout(self.frame) {
            Ok(ev) => ev,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => AppEvent::Tick,
        }
    }
}

/// Drain `outputs` on a worker thread, forwarding each line to the event loop.
///
/// `RunFinished` is always sent last, also when the worker unwinds.
pub fn spawn_run(outputs: RunOutput, tx: Sender<AppEvent>) -> JoinHandle<()> {
    thread::spawn(move || {
        let _finished = RunFinishedGuard { tx: tx.clone() };
        for output in outputs {
            if tx.send(AppEvent::Output(output)).is_err() {
                break;
            }
        }
    })
}

struct RunFinishedGuard {
    tx: Sender<AppEvent>,
}

impl Drop for RunFinishedGuard {
    fn drop(&mut self) {
        let aborted = thread::panicking();
        let _ = self.tx.send(AppEvent::RunFinished { aborted });
    }
}

/// Repeating timer with start/stop as its only transitions.
///
/// The ticker does not run on its own; owners `poll` it with the current
/// instant and act when it reports a due tick.
#[derive(Debug, Clone)]
pub struct Ticker {
    interval: Duration,
    next_due: Option<DateTime<Utc>>,
}

impl Ticker {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_due: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// (Re)arm the ticker; any previous schedule is replaced
    pub fn start(&mut self, now: DateTime<Utc>) {
        self.next_due = Some(now + self.step());
    }

    pub fn stop(&mut self) {
        self.next_due = None;
    }

    pub fn is_running(&self) -> bool {
        self.next_due.is_some()
    }

    /// True when a tick is due; reschedules one interval after `now`
    pub fn poll(&mut self, now: DateTime<Utc>) -> bool {
        match self.next_due {
            Some(due) if now >= due => {
                self.next_due = Some(now + self.step());
                true
            }
            _ => false,
        }
    }

    fn step(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.interval).unwrap_or_else(|_| chrono::Duration::seconds(1))
    }
}
