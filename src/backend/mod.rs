//! Execution backends: run editor code against the problem dataset.
//!
//! Two variants share one contract (`init`, `is_initialized`, `skeleton`,
//! `run`). Each variant drives a local interpreter through a fixed driver
//! script that binds the dataset to the global `dataset`, captures printed
//! output, and writes a JSON report to a file named on its command line.
//! Whatever reaches the process's own stdout or stderr outside the capture
//! is forwarded as extra output lines.

pub mod javascript;
pub mod python;

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};

use crate::language::Language;

/// First line of every run transcript
pub const START_MARKER: &str = ">>> Running code...";
/// Last line of a run that completed without an uncaught failure
pub const END_MARKER: &str = ">>> Done.";
/// Lines carrying the value of the trailing expression; ignored on submit
pub const RESULT_PREFIX: &str = "Result:";
/// Name the dataset text is bound to inside the interpreter
pub const DATASET_GLOBAL: &str = "dataset";

pub const NOT_INITIALIZED: &str = "not initialized yet";
pub const RUN_ABORTED: &str = "Execution aborted.";

const WAIT_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Error,
    Success,
    Plain,
}

/// One line of run output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub text: String,
    #[serde(rename = "type")]
    pub kind: OutputKind,
}

impl Output {
    pub fn new(text: impl Into<String>, kind: OutputKind) -> Self {
        Self {
            text: text.into(),
            kind,
        }
    }

    pub fn plain(text: impl Into<String>) -> Self {
        Self::new(text, OutputKind::Plain)
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::new(text, OutputKind::Error)
    }

    pub fn success(text: impl Into<String>) -> Self {
        Self::new(text, OutputKind::Success)
    }

    pub fn is_start_marker(&self) -> bool {
        self.text.contains(START_MARKER)
    }

    pub fn is_end_marker(&self) -> bool {
        self.text.contains(END_MARKER)
    }
}

/// Shape of the dataset as judged from its first line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetShape {
    TabSeparated,
    CommaSeparated,
    Plain,
}

impl DatasetShape {
    pub fn detect(dataset: &str) -> Self {
        let first = dataset.trim().lines().next().unwrap_or_default();
        if first.contains('\t') {
            DatasetShape::TabSeparated
        } else if first.contains(',') {
            DatasetShape::CommaSeparated
        } else {
            DatasetShape::Plain
        }
    }

    /// Separator as written inside a string literal of either language
    pub fn separator_literal(self) -> Option<&'static str> {
        match self {
            DatasetShape::TabSeparated => Some("\\t"),
            DatasetShape::CommaSeparated => Some(","),
            DatasetShape::Plain => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{language} interpreter `{command}` could not be started: {source}")]
    Spawn {
        language: Language,
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("{language} interpreter `{command}` is not usable: {detail}")]
    Unusable {
        language: Language,
        command: String,
        detail: String,
    },
    #[error("failed to stage the dataset: {0}")]
    Dataset(#[source] io::Error),
}

/// Dataset text staged on disk for the interpreter; removed on drop
#[derive(Debug)]
struct StagedDataset {
    text: String,
    file: NamedTempFile,
}

impl StagedDataset {
    fn stage(text: &str) -> io::Result<Self> {
        let mut file = tempfile::Builder::new()
            .prefix("timebox-dataset-")
            .suffix(".txt")
            .tempfile()?;
        file.write_all(text.as_bytes())?;
        file.flush()?;
        Ok(Self {
            text: text.to_string(),
            file,
        })
    }
}

/// Interpreter state shared by both variants
#[derive(Debug, Clone)]
pub struct Interpreter {
    command: String,
    staged: Option<Arc<StagedDataset>>,
}

impl Interpreter {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            staged: None,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

/// One execution backend per language
#[derive(Debug, Clone)]
pub enum ExecutionBackend {
    Python(Interpreter),
    Javascript(Interpreter),
}

impl ExecutionBackend {
    pub fn new(language: Language, command: impl Into<String>) -> Self {
        let interpreter = Interpreter::new(command);
        match language {
            Language::Python => ExecutionBackend::Python(interpreter),
            Language::Javascript => ExecutionBackend::Javascript(interpreter),
        }
    }

    pub fn language(&self) -> Language {
        match self {
            ExecutionBackend::Python(_) => Language::Python,
            ExecutionBackend::Javascript(_) => Language::Javascript,
        }
    }

    fn interpreter(&self) -> &Interpreter {
        match self {
            ExecutionBackend::Python(i) | ExecutionBackend::Javascript(i) => i,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.interpreter().staged.is_some()
    }

    /// Check the interpreter and stage the dataset. Idempotent.
    pub fn init(&mut self, dataset: &str) -> Result<(), BackendError> {
        if self.is_initialized() {
            return Ok(());
        }
        let language = self.language();
        let interpreter = match self {
            ExecutionBackend::Python(i) | ExecutionBackend::Javascript(i) => i,
        };

        let version = probe_interpreter(language, &interpreter.command)?;
        let staged = StagedDataset::stage(dataset).map_err(BackendError::Dataset)?;
        info!(%language, command = %interpreter.command, %version, "execution backend ready");
        interpreter.staged = Some(Arc::new(staged));
        Ok(())
    }

    /// Starter code for the loaded dataset
    pub fn skeleton(&self) -> String {
        let shape = self
            .interpreter()
            .staged
            .as_ref()
            .map(|staged| DatasetShape::detect(&staged.text))
            .unwrap_or(DatasetShape::Plain);
        match self {
            ExecutionBackend::Python(_) => python::skeleton(shape),
            ExecutionBackend::Javascript(_) => javascript::skeleton(shape),
        }
    }

    /// Lazily execute `code` once; see [`RunOutput`] for the yielded sequence
    pub fn run(&self, code: &str) -> RunOutput {
        let interpreter = self.interpreter();
        let stage = match &interpreter.staged {
            Some(staged) => Stage::Pending(Job {
                language: self.language(),
                command: interpreter.command.clone(),
                code: code.to_string(),
                dataset: Arc::clone(staged),
            }),
            None => Stage::NotReady,
        };
        RunOutput {
            stage,
            abort: RunAbort::default(),
        }
    }
}

/// Kill switch for one run; clones share the interpreter process
#[derive(Debug, Clone, Default)]
pub struct RunAbort {
    slot: Arc<Mutex<ProcessSlot>>,
}

#[derive(Debug, Default)]
struct ProcessSlot {
    child: Option<Child>,
    aborted: bool,
}

impl Drop for ProcessSlot {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl RunAbort {
    /// Kill the interpreter, or keep it from being spawned at all
    pub fn abort(&self) {
        let mut slot = self.lock();
        slot.aborted = true;
        if let Some(child) = slot.child.as_mut() {
            match child.kill() {
                Ok(()) => info!(pid = child.id(), "interpreter killed"),
                Err(err) => debug!(%err, "interpreter already gone"),
            }
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.lock().aborted
    }

    fn lock(&self) -> MutexGuard<'_, ProcessSlot> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Output of one run: the start marker, captured lines, then the end marker.
///
/// The interpreter is only spawned when the item after the start marker is
/// pulled. An uncaught failure yields a single error line instead of the
/// captured lines and ends the sequence without the end marker.
#[derive(Debug)]
pub struct RunOutput {
    stage: Stage,
    abort: RunAbort,
}

impl RunOutput {
    /// Handle that kills the interpreter of this run from another thread
    pub fn abort_handle(&self) -> RunAbort {
        self.abort.clone()
    }
}

#[derive(Debug)]
enum Stage {
    NotReady,
    Pending(Job),
    Execute(Job),
    Draining(VecDeque<Output>),
    Finished,
}

impl Iterator for RunOutput {
    type Item = Output;

    fn next(&mut self) -> Option<Output> {
        match std::mem::replace(&mut self.stage, Stage::Finished) {
            Stage::NotReady => Some(Output::error(NOT_INITIALIZED)),
            Stage::Pending(job) => {
                self.stage = Stage::Execute(job);
                Some(Output::success(START_MARKER))
            }
            Stage::Execute(job) => {
                self.stage = Stage::Draining(job.execute(&self.abort));
                self.next()
            }
            Stage::Draining(mut lines) => {
                let line = lines.pop_front();
                if line.is_some() {
                    self.stage = Stage::Draining(lines);
                }
                line
            }
            Stage::Finished => None,
        }
    }
}

#[derive(Debug)]
struct Job {
    language: Language,
    command: String,
    code: String,
    dataset: Arc<StagedDataset>,
}

/// What the driver scripts write to the report file
#[derive(Debug, Deserialize)]
struct DriverReport {
    #[serde(default)]
    lines: Vec<Output>,
    /// Value of the trailing expression, already formatted
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Everything one interpreter process produced
#[derive(Debug)]
struct Finished {
    report: DriverReport,
    status: ExitStatus,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl Finished {
    fn into_lines(self, language: Language) -> VecDeque<Output> {
        if let Some(error) = self.report.error {
            return VecDeque::from([Output::error(error)]);
        }

        let mut lines = VecDeque::from(self.report.lines);
        lines.extend(stray_lines(&self.stdout, Output::plain));
        lines.extend(stray_lines(&self.stderr, Output::error));
        if let Some(value) = self.report.result {
            lines.push_back(Output::plain(format!("{RESULT_PREFIX} {value}")));
        }
        if self.status.success() {
            lines.push_back(Output::success(END_MARKER));
        } else {
            // late failure, e.g. an async callback threw after the report was written
            lines.push_back(Output::error(format!(
                "{} exited with {}",
                language.label(),
                self.status
            )));
        }
        lines
    }
}

fn stray_lines(bytes: &[u8], kind: fn(String) -> Output) -> Vec<Output> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(|line| kind(line.to_string()))
        .collect()
}

impl Job {
    fn execute(self, abort: &RunAbort) -> VecDeque<Output> {
        match self.spawn(abort) {
            Ok(finished) => finished.into_lines(self.language),
            Err(failure) => VecDeque::from([Output::error(failure)]),
        }
    }

    fn spawn(&self, abort: &RunAbort) -> Result<Finished, String> {
        let mut source = tempfile::Builder::new()
            .prefix("timebox-code-")
            .suffix(self.language.source_suffix())
            .tempfile()
            .map_err(|e| format!("failed to stage code: {e}"))?;
        source
            .write_all(self.code.as_bytes())
            .and_then(|_| source.flush())
            .map_err(|e| format!("failed to stage code: {e}"))?;
        let report_file = tempfile::Builder::new()
            .prefix("timebox-report-")
            .suffix(".json")
            .tempfile()
            .map_err(|e| format!("failed to stage code: {e}"))?;

        let mut cmd = driver_command(
            self.language,
            &self.command,
            source.path(),
            self.dataset.file.path(),
            report_file.path(),
        );
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let (stdout, stderr) = {
            let mut slot = abort.lock();
            if slot.aborted {
                return Err(RUN_ABORTED.to_string());
            }
            let mut child = cmd
                .spawn()
                .map_err(|e| format!("failed to start {}: {e}", self.command))?;
            debug!(language = %self.language, pid = child.id(), "running code");
            let pipes = (drain(child.stdout.take()), drain(child.stderr.take()));
            slot.child = Some(child);
            pipes
        };

        let status = self.wait(abort)?;
        if abort.is_aborted() {
            // grandchildren may still hold the pipes open; leave the readers behind
            return Err(RUN_ABORTED.to_string());
        }
        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();

        let report = fs::read(report_file.path())
            .ok()
            .and_then(|bytes| serde_json::from_slice::<DriverReport>(&bytes).ok());
        match report {
            Some(report) => Ok(Finished {
                report,
                status,
                stdout,
                stderr,
            }),
            None => {
                let stderr = String::from_utf8_lossy(&stderr);
                if stderr.trim().is_empty() {
                    Err(format!("{} exited with {}", self.language.label(), status))
                } else {
                    Err(stderr.trim().to_string())
                }
            }
        }
    }

    /// Poll the child so an abort can take the lock and kill it meanwhile
    fn wait(&self, abort: &RunAbort) -> Result<ExitStatus, String> {
        loop {
            {
                let mut slot = abort.lock();
                let Some(child) = slot.child.as_mut() else {
                    return Err(RUN_ABORTED.to_string());
                };
                match child.try_wait() {
                    Ok(Some(status)) => {
                        slot.child = None;
                        return Ok(status);
                    }
                    Ok(None) => {}
                    Err(e) => return Err(format!("failed to wait for {}: {e}", self.command)),
                }
            }
            thread::sleep(WAIT_POLL);
        }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

fn driver_command(
    language: Language,
    command: &str,
    code: &Path,
    dataset: &Path,
    report: &Path,
) -> Command {
    let (flag, driver) = match language {
        Language::Python => ("-c", python::DRIVER),
        Language::Javascript => ("-e", javascript::DRIVER),
    };
    let mut cmd = Command::new(command);
    cmd.arg(flag).arg(driver).arg(code).arg(dataset).arg(report);
    cmd
}

fn probe_interpreter(language: Language, command: &str) -> Result<String, BackendError> {
    let output = Command::new(command)
        .arg("--version")
        .stdin(Stdio::null())
        .output()
        .map_err(|source| BackendError::Spawn {
            language,
            command: command.to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(BackendError::Unusable {
            language,
            command: command.to_string(),
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    // python2 and some builds report the version on stderr
    let version = if output.stdout.is_empty() {
        output.stderr
    } else {
        output.stdout
    };
    Ok(String::from_utf8_lossy(&version).trim().to_string())
}
