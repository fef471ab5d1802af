//! Editor controller: binds the session, the execution backends, the editing
//! surface and the output transcript, and owns the start/run/clear/submit
//! actions.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::backend::{BackendError, ExecutionBackend, Output, RunAbort, RunOutput, RUN_ABORTED};
use crate::clock::Clock;
use crate::config::Config;
use crate::language::Language;
use crate::session::{ProblemSession, SessionError, SessionEvent, SessionState};
use crate::signals::{CooldownProbe, SolvedProbe};
use crate::store::{ProblemStore, CODE_KEY, LANGUAGE_KEY, TRANSCRIPT_KEY};
use crate::submit::{SubmissionFile, SubmitError, Submitter};
use crate::surface::EditorSurface;
use crate::transcript::Transcript;

pub const NOT_STARTED_PLACEHOLDER: &str = "Press Ctrl-S to start the 5:00 solve window.";
pub const EXPIRED_NOTICE: &str = "Time is up! The solve window has closed.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Success,
    Error,
}

/// User-facing status message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub text: String,
}

/// Readiness of the backend bound to the current language
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendStatus {
    Loading,
    Ready,
    Failed(String),
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("The {} runtime is not ready yet.", .0.label())]
    BackendNotReady(Language),
    #[error("Nothing to run: the editor is empty.")]
    EmptyCode,
    #[error("Code is already running.")]
    RunInFlight,
    #[error("No output to submit. Run your code first.")]
    NoOutput,
    #[error("The language cannot be changed for a solved problem.")]
    SelectorLocked,
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Everything the controller needs from the bootstrap
pub struct SessionContext {
    pub problem_id: String,
    pub store: ProblemStore,
    pub clock: Arc<dyn Clock>,
    pub dataset: String,
    pub config: Config,
    /// Overrides (and replaces) the remembered language
    pub language: Option<Language>,
    pub solved: Box<dyn SolvedProbe>,
    pub cooldown: Box<dyn CooldownProbe>,
    pub submitter: Box<dyn Submitter>,
}

pub struct EditorController<S: EditorSurface> {
    problem_id: String,
    store: ProblemStore,
    session: ProblemSession,
    surface: S,
    transcript: Transcript,
    python: ExecutionBackend,
    javascript: ExecutionBackend,
    language: Language,
    dataset: Arc<str>,
    status: BackendStatus,
    running: bool,
    run_abort: Option<RunAbort>,
    notices: Vec<Notice>,
    cooldown: Box<dyn CooldownProbe>,
    submitter: Box<dyn Submitter>,
}

impl<S: EditorSurface> EditorController<S> {
    pub fn new(ctx: SessionContext, surface: S) -> Self {
        let SessionContext {
            problem_id,
            store,
            clock,
            dataset,
            config,
            language,
            solved,
            cooldown,
            submitter,
        } = ctx;

        let session = ProblemSession::load(store.clone(), clock, solved.as_ref(), cooldown.as_ref());
        let remembered = || {
            store
                .get::<Language>(&[LANGUAGE_KEY])
                .unwrap_or(config.default_language)
        };
        let language = match language {
            Some(language) if !session.is_solved() => {
                store.save(&[LANGUAGE_KEY], &language);
                language
            }
            Some(language) => {
                debug!(%language, "language override ignored for a solved problem");
                remembered()
            }
            None => remembered(),
        };
        let transcript = store.get::<Transcript>(&[TRANSCRIPT_KEY]).unwrap_or_default();

        let mut controller = Self {
            problem_id,
            store,
            session,
            surface,
            transcript,
            python: ExecutionBackend::new(
                Language::Python,
                config.command_for(Language::Python),
            ),
            javascript: ExecutionBackend::new(
                Language::Javascript,
                config.command_for(Language::Javascript),
            ),
            language,
            dataset: Arc::from(dataset),
            status: BackendStatus::Loading,
            running: false,
            run_abort: None,
            notices: Vec::new(),
            cooldown,
            submitter,
        };
        controller.refresh_surface();
        if controller.state() == SessionState::Expired {
            // the stored window lapsed while the editor was closed
            controller.notify(NoticeLevel::Error, EXPIRED_NOTICE);
        }
        controller
    }

    pub fn problem_id(&self) -> &str {
        &self.problem_id
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn session(&self) -> &ProblemSession {
        &self.session
    }

    pub fn remaining_secs(&self) -> Option<u64> {
        self.session.remaining_secs()
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn status(&self) -> &BackendStatus {
        &self.status
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    /// Edits made through this handle must be followed by [`Self::on_code_changed`]
    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn can_run(&self) -> bool {
        !self.running && self.session.can_edit() && self.status == BackendStatus::Ready
    }

    pub fn can_start(&self) -> bool {
        self.session.can_start()
    }

    pub fn language_selector_enabled(&self) -> bool {
        !self.session.is_solved() && !self.running
    }

    pub fn notices(&self) -> &[Notice] {
        &self.notices
    }

    pub fn last_notice(&self) -> Option<&Notice> {
        self.notices.last()
    }

    pub fn notify(&mut self, level: NoticeLevel, text: impl Into<String>) {
        let text = text.into();
        debug!(?level, %text, "notice");
        self.notices.push(Notice { level, text });
    }

    /// Surface a rejected action; a run attempted while one is in flight is ignored
    pub fn report<T>(&mut self, result: Result<T, ControllerError>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(ControllerError::RunInFlight) => None,
            Err(err) => {
                self.notify(NoticeLevel::Error, err.to_string());
                None
            }
        }
    }

    fn backend(&self, language: Language) -> &ExecutionBackend {
        match language {
            Language::Python => &self.python,
            Language::Javascript => &self.javascript,
        }
    }

    fn backend_mut(&mut self, language: Language) -> &mut ExecutionBackend {
        match language {
            Language::Python => &mut self.python,
            Language::Javascript => &mut self.javascript,
        }
    }

    /// Initialise the bound backend; the caller shows the loading overlay meanwhile
    pub fn ensure_backend(&mut self) -> Result<(), ControllerError> {
        let language = self.language;
        let dataset = Arc::clone(&self.dataset);
        match self.backend_mut(language).init(&dataset) {
            Ok(()) => {
                self.status = BackendStatus::Ready;
                self.refresh_surface();
                Ok(())
            }
            Err(err) => {
                error!(%language, %err, "execution backend failed to initialise");
                self.status = BackendStatus::Failed(err.to_string());
                Err(err.into())
            }
        }
    }

    pub fn start(&mut self) -> Result<(), ControllerError> {
        let resumed = self.session.state() == SessionState::Started;
        self.session.start()?;
        if !resumed {
            self.refresh_surface();
            self.notify(NoticeLevel::Info, "Solve window started: 5:00 on the clock.");
        }
        Ok(())
    }

    /// Run the editor content and drain the output into the transcript
    pub fn run(&mut self) -> Result<(), ControllerError> {
        let outputs = self.begin_run()?;
        self.drain(outputs);
        Ok(())
    }

    /// A panic while pulling the next line ends the run with an error line
    fn drain(&mut self, mut outputs: impl Iterator<Item = Output>) {
        let failure = loop {
            match panic::catch_unwind(AssertUnwindSafe(|| outputs.next())) {
                Ok(Some(output)) => self.push_output(output),
                Ok(None) => break None,
                Err(_) => break Some(RUN_ABORTED.to_string()),
            }
        };
        self.finish_run(failure);
    }

    /// Validate and claim the run control; the caller drains the returned
    /// sequence through [`Self::push_output`] and then calls [`Self::finish_run`]
    pub fn begin_run(&mut self) -> Result<RunOutput, ControllerError> {
        if self.running {
            return Err(ControllerError::RunInFlight);
        }
        let backend = self.backend(self.language);
        if !backend.is_initialized() {
            return Err(ControllerError::BackendNotReady(self.language));
        }
        self.require_open()?;
        let code = self.surface.text();
        if code.trim().is_empty() {
            return Err(ControllerError::EmptyCode);
        }

        self.running = true;
        info!(language = %self.language, bytes = code.len(), "run started");
        let outputs = self.backend(self.language).run(&code);
        self.run_abort = Some(outputs.abort_handle());
        Ok(outputs)
    }

    /// Kill the interpreter of the run in flight; `finish_run` still follows
    pub fn abort_run(&mut self) {
        if let Some(abort) = self.run_abort.take() {
            info!("aborting the run in flight");
            abort.abort();
        }
    }

    pub fn push_output(&mut self, output: Output) {
        self.transcript.push(output);
    }

    /// Release the run control; `failure` is appended as a final error line
    pub fn finish_run(&mut self, failure: Option<String>) {
        if let Some(failure) = failure {
            error!(%failure, "run aborted while draining output");
            self.transcript.push(Output::error(failure));
        }
        self.running = false;
        self.run_abort = None;
        self.persist_transcript();
    }

    pub fn clear_output(&mut self) -> Result<(), ControllerError> {
        if self.running {
            return Err(ControllerError::RunInFlight);
        }
        self.transcript.clear();
        self.persist_transcript();
        Ok(())
    }

    /// Hand the last run's output to the host and wait out its cooldown
    pub fn submit(&mut self) -> Result<(), ControllerError> {
        if self.running {
            return Err(ControllerError::RunInFlight);
        }
        self.require_open()?;
        let text = self.transcript.submission_text();
        if text.is_empty() {
            return Err(ControllerError::NoOutput);
        }

        let file = SubmissionFile::new(text);
        self.submitter.submit(&self.problem_id, &file)?;
        self.session.mark_submitted()?;
        self.refresh_surface();
        info!(problem = %self.problem_id, bytes = file.contents.len(), "submitted");
        self.notify(
            NoticeLevel::Success,
            format!(
                "Submitted {}. Resubmission is locked while the host cooldown (about 50s) lasts.",
                file.file_name
            ),
        );
        Ok(())
    }

    pub fn switch_language(&mut self, language: Language) -> Result<(), ControllerError> {
        if self.session.is_solved() {
            return Err(ControllerError::SelectorLocked);
        }
        if self.running {
            return Err(ControllerError::RunInFlight);
        }
        if language == self.language {
            return Ok(());
        }

        self.language = language;
        self.store.save(&[LANGUAGE_KEY], &language);
        self.status = if self.backend(language).is_initialized() {
            BackendStatus::Ready
        } else {
            BackendStatus::Loading
        };
        self.refresh_surface();
        info!(%language, "language switched");
        Ok(())
    }

    /// Change notification from the surface
    pub fn on_code_changed(&mut self) {
        self.expire_if_due();
        if !self.session.can_edit() {
            debug!(state = %self.session.state(), "ignoring edit outside the solve window");
            return;
        }
        let code = self.surface.text();
        self.store.save(&[CODE_KEY, self.language.key()], &code);
    }

    /// Drop the saved code of a solved problem
    pub fn acknowledge_solved(&mut self) -> bool {
        if !self.session.is_solved() {
            return false;
        }
        self.store.remove(&[CODE_KEY]);
        self.refresh_surface();
        true
    }

    /// Advance the session timers and apply their effects
    pub fn tick(&mut self) -> Vec<SessionEvent> {
        let events = self.session.tick(self.cooldown.as_ref());
        for event in &events {
            self.apply(*event);
        }
        events
    }

    fn apply(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Tick { .. } => {}
            SessionEvent::Expired => {
                self.refresh_surface();
                self.notify(NoticeLevel::Error, EXPIRED_NOTICE);
            }
            SessionEvent::CooldownCleared => {
                self.transcript.clear();
                self.persist_transcript();
                self.refresh_surface();
                self.notify(NoticeLevel::Info, "Cooldown over. The editor is unlocked again.");
            }
        }
    }

    fn require_open(&mut self) -> Result<(), ControllerError> {
        self.expire_if_due();
        Ok(self.session.require_open()?)
    }

    /// Close a window whose time ran out between ticks
    fn expire_if_due(&mut self) {
        if self.session.expire_if_due() {
            self.apply(SessionEvent::Expired);
        }
    }

    fn saved_code(&self, language: Language) -> Option<String> {
        self.store.get::<String>(&[CODE_KEY, language.key()])
    }

    /// Re-derive surface content and editability from the session state
    fn refresh_surface(&mut self) {
        let language = self.language;
        self.surface.set_language(language);

        match self.session.state() {
            SessionState::NotStarted => {
                self.surface.set_editable(false);
                self.surface.set_text("");
                self.surface.set_placeholder(Some(NOT_STARTED_PLACEHOLDER));
            }
            SessionState::Solved => {
                let code = self.saved_code(language).unwrap_or_default();
                self.surface.set_editable(false);
                self.surface.set_placeholder(None);
                self.surface.set_text(&code);
            }
            state => {
                let code = self
                    .saved_code(language)
                    .unwrap_or_else(|| self.backend(language).skeleton());
                self.surface.set_placeholder(None);
                self.surface.set_text(&code);
                self.surface.set_editable(state == SessionState::Started);
            }
        }
    }

    fn persist_transcript(&self) {
        self.store.save(&[TRANSCRIPT_KEY], &self.transcript);
    }
}

impl<S: EditorSurface> Drop for EditorController<S> {
    fn drop(&mut self) {
        self.abort_run();
    }
}
