//! Host-side signals the session observes but does not control.

use std::fs;
use std::path::{Path, PathBuf};

/// Substring of the host's result label that marks a problem as solved
pub const SOLVED_MARKER: &str = "Congratulations";

/// Whether the host is currently refusing resubmissions
pub trait CooldownProbe {
    fn is_active(&self) -> bool;
}

impl<F: Fn() -> bool> CooldownProbe for F {
    fn is_active(&self) -> bool {
        self()
    }
}

/// Whether the host already reports the problem as solved; checked once at load
pub trait SolvedProbe {
    fn is_solved(&self) -> bool;
}

/// No host signal configured
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSignal;

impl CooldownProbe for NoSignal {
    fn is_active(&self) -> bool {
        false
    }
}

impl SolvedProbe for NoSignal {
    fn is_solved(&self) -> bool {
        false
    }
}

/// Cooldown is active while the marker file exists
#[derive(Debug, Clone)]
pub struct MarkerFileProbe {
    path: PathBuf,
}

impl MarkerFileProbe {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl CooldownProbe for MarkerFileProbe {
    fn is_active(&self) -> bool {
        self.path.exists()
    }
}

/// Solved when the result label file contains the congratulation marker
#[derive(Debug, Clone)]
pub struct LabelFileProbe {
    path: PathBuf,
}

impl LabelFileProbe {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl SolvedProbe for LabelFileProbe {
    fn is_solved(&self) -> bool {
        fs::read_to_string(&self.path)
            .map(|label| label.contains(SOLVED_MARKER))
            .unwrap_or(false)
    }
}
