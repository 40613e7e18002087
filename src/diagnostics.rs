use std::fmt;

use serde_derive::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    Error,
    Warning,
    Note,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
            Severity::Note => write!(f, "note"),
        }
    }
}

/// One user facing message, tagged with the nodes it originated from so an
/// editor can highlight them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub nodes: Vec<Uuid>,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.severity, self.message)
    }
}

/// Diagnostics sink for one compile invocation. The running error count is
/// the only gate between compile stages; errors never unwind.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct CompilerLog {
    messages: Vec<Diagnostic>,
    num_errors: usize,
}

impl CompilerLog {
    pub fn report(&mut self, severity: Severity, message: String, nodes: Vec<Uuid>) {
        if severity == Severity::Error {
            self.num_errors += 1;
        }
        self.messages.push(Diagnostic {
            severity,
            message,
            nodes,
        });
    }

    pub fn error(&mut self, message: impl Into<String>, nodes: impl IntoIterator<Item = Uuid>) {
        self.report(Severity::Error, message.into(), nodes.into_iter().collect());
    }

    pub fn warning(&mut self, message: impl Into<String>, nodes: impl IntoIterator<Item = Uuid>) {
        self.report(
            Severity::Warning,
            message.into(),
            nodes.into_iter().collect(),
        );
    }

    pub fn note(&mut self, message: impl Into<String>, nodes: impl IntoIterator<Item = Uuid>) {
        self.report(Severity::Note, message.into(), nodes.into_iter().collect());
    }

    pub fn num_errors(&self) -> usize {
        self.num_errors
    }

    pub fn has_errors(&self) -> bool {
        self.num_errors > 0
    }

    pub fn messages(&self) -> &[Diagnostic] {
        &self.messages
    }

    pub fn with_severity(&self, severity: Severity) -> impl Iterator<Item = &Diagnostic> {
        self.messages
            .iter()
            .filter(move |message| message.severity == severity)
    }

    /// First message whose text contains the fragment, any severity.
    pub fn find(&self, fragment: &str) -> Option<&Diagnostic> {
        self.messages
            .iter()
            .find(|message| message.message.contains(fragment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_count_tracks_only_errors() {
        let mut log = CompilerLog::default();
        log.warning("first", []);
        log.note("second", []);
        assert!(!log.has_errors());

        log.error("third", [Uuid::new_v4()]);
        assert_eq!(log.num_errors(), 1);
        assert_eq!(log.messages().len(), 3);
        assert!(log.find("third").is_some());
        assert_eq!(log.with_severity(Severity::Warning).count(), 1);
    }
}
