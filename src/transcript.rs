use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::backend::{Output, OutputKind, RESULT_PREFIX};

/// Ordered output log shown under the editor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Transcript {
    lines: Vec<Output>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, output: Output) {
        self.lines.push(output);
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub fn lines(&self) -> &[Output] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Output of the most recent run, as handed in on submit.
    ///
    /// Starts after the last start marker and stops at the end marker (or the
    /// end of the log). Error lines and `Result:` lines are left out.
    pub fn submission_text(&self) -> String {
        let Some(start) = self.lines.iter().rposition(Output::is_start_marker) else {
            return String::new();
        };

        self.lines[start + 1..]
            .iter()
            .take_while(|line| !line.is_end_marker())
            .filter(|line| line.kind != OutputKind::Error && !line.text.starts_with(RESULT_PREFIX))
            .map(|line| line.text.trim())
            .join("\n")
            .trim()
            .to_string()
    }
}

impl Extend<Output> for Transcript {
    fn extend<I: IntoIterator<Item = Output>>(&mut self, iter: I) {
        self.lines.extend(iter);
    }
}

impl FromIterator<Output> for Transcript {
    fn from_iter<I: IntoIterator<Item = Output>>(iter: I) -> Self {
        Self {
            lines: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{END_MARKER, START_MARKER};

    fn run_log(body: &[&str]) -> Vec<Output> {
        std::iter::once(Output::success(START_MARKER))
            .chain(body.iter().map(|line| Output::plain(*line)))
            .chain(std::iter::once(Output::success(END_MARKER)))
            .collect()
    }

    #[test]
    fn extracts_last_run_without_result_lines() {
        let transcript: Transcript = run_log(&["line1", "line2", "Result: x"])
            .into_iter()
            .collect();
        assert_eq!(transcript.submission_text(), "line1\nline2");
    }

    #[test]
    fn only_the_most_recent_run_counts() {
        let mut transcript: Transcript = run_log(&["old"]).into_iter().collect();
        transcript.extend(run_log(&["new"]));
        assert_eq!(transcript.submission_text(), "new");
    }

    #[test]
    fn error_lines_are_skipped() {
        let mut transcript = Transcript::new();
        transcript.push(Output::success(START_MARKER));
        transcript.push(Output::plain("  42  "));
        transcript.push(Output::error("DeprecationWarning"));
        transcript.push(Output::plain("43"));
        transcript.push(Output::success(END_MARKER));
        assert_eq!(transcript.submission_text(), "42\n43");
    }

    #[test]
    fn unterminated_run_reads_to_end_of_log() {
        let mut transcript = Transcript::new();
        transcript.push(Output::success(START_MARKER));
        transcript.push(Output::plain("partial"));
        assert_eq!(transcript.submission_text(), "partial");
    }

    #[test]
    fn failed_run_has_nothing_to_submit() {
        let mut transcript = Transcript::new();
        transcript.push(Output::success(START_MARKER));
        transcript.push(Output::error("NameError: name 'x' is not defined"));
        assert_eq!(transcript.submission_text(), "");
    }

    #[test]
    fn marker_less_log_is_empty() {
        let mut transcript = Transcript::new();
        assert_eq!(transcript.submission_text(), "");
        transcript.push(Output::plain("stray"));
        assert_eq!(transcript.submission_text(), "");
    }

    #[test]
    fn serializes_as_a_plain_list() {
        let transcript: Transcript = vec![Output::plain("a")].into_iter().collect();
        let json = serde_json::to_string(&transcript).unwrap();
        assert_eq!(json, r#"[{"text":"a","type":"plain"}]"#);
        let back: Transcript = serde_json::from_str(&json).unwrap();
        assert_eq!(back, transcript);
    }
}
