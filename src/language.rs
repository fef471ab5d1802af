use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Languages with an execution backend
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    ValueEnum,
    strum_macros::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Language {
    #[default]
    Python,
    Javascript,
}

impl Language {
    pub const ALL: [Language; 2] = [Language::Python, Language::Javascript];

    /// The other language; used by the language selector
    pub fn toggle(self) -> Self {
        match self {
            Language::Python => Language::Javascript,
            Language::Javascript => Language::Python,
        }
    }

    /// Segment used for this language in store key paths
    pub fn key(self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Javascript => "javascript",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Language::Python => "Python",
            Language::Javascript => "JavaScript",
        }
    }

    pub fn source_suffix(self) -> &'static str {
        match self {
            Language::Python => ".py",
            Language::Javascript => ".js",
        }
    }
}
