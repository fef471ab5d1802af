use chrono::Utc;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

pub const SUBMISSION_FILE_NAME: &str = "output.txt";

/// Text payload handed to the host's submission form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionFile {
    pub file_name: String,
    pub contents: String,
}

impl SubmissionFile {
    pub fn new(contents: impl Into<String>) -> Self {
        Self {
            file_name: SUBMISSION_FILE_NAME.to_string(),
            contents: contents.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("submission form not found ({})", .0.display())]
    FormMissing(PathBuf),
    #[error("failed to attach the submission file: {0}")]
    Io(#[from] io::Error),
}

/// The host's native submission mechanism; its outcome is not observed
pub trait Submitter {
    fn submit(&mut self, problem_id: &str, file: &SubmissionFile) -> Result<(), SubmitError>;
}

/// Hands submissions over by dropping them into an outbox directory
#[derive(Debug, Clone)]
pub struct OutboxSubmitter {
    dir: PathBuf,
}

impl OutboxSubmitter {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Submitter for OutboxSubmitter {
    fn submit(&mut self, problem_id: &str, file: &SubmissionFile) -> Result<(), SubmitError> {
        if !self.dir.is_dir() {
            return Err(SubmitError::FormMissing(self.dir.clone()));
        }

        let name = format!(
            "{}-{}-{}",
            problem_id,
            Utc::now().format("%Y%m%dT%H%M%S"),
            file.file_name
        );
        let path = self.dir.join(name);
        fs::write(&path, &file.contents)?;
        info!(problem = problem_id, path = %path.display(), "submission handed to outbox");
        Ok(())
    }
}
