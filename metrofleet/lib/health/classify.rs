use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const OOM_PATTERNS: &[&str] = &[
    "out of memory",
    "javascript heap out of memory",
    "enomem",
    "oomkilled",
    "killed process",
];

const CRASH_PATTERNS: &[&str] = &[
    "segmentation fault",
    "sigsegv",
    "fatal error",
    "core dumped",
    "uncaught exception",
    "unhandled promise rejection",
];

const NETWORK_PATTERNS: &[&str] = &[
    "econnrefused",
    "connection refused",
    "econnreset",
    "connection reset",
    "etimedout",
    "enotfound",
    "eaddrinuse",
    "socket hang up",
];

const BUILD_PATTERNS: &[&str] = &[
    "error:",
    "syntaxerror",
    "syntax error",
    "unable to resolve module",
    "module not found",
    "transform error",
];

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The kind of failure found in a bundler's logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The process died.
    Crash,

    /// The process ran out of memory.
    Oom,

    /// The process could not reach or bind a socket.
    Network,

    /// The bundle failed to build.
    Build,
}

/// A failure found in a bundler's logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFailure {
    /// The classified kind.
    pub kind: FailureKind,

    /// The first log line that matched.
    pub line: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FailureKind {
    /// Whether restarting the sandbox can fix this kind of failure.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, FailureKind::Network | FailureKind::Build)
    }

    fn patterns(&self) -> &'static [&'static str] {
        match self {
            FailureKind::Oom => OOM_PATTERNS,
            FailureKind::Crash => CRASH_PATTERNS,
            FailureKind::Network => NETWORK_PATTERNS,
            FailureKind::Build => BUILD_PATTERNS,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Classifies raw process log text.
///
/// Kinds are tried from most to least severe, so a log that reports both an out-of-memory
/// condition and the resulting `fatal error` is classified as [`FailureKind::Oom`].
pub fn classify_logs(logs: &str) -> Option<LogFailure> {
    let lowered = logs.to_lowercase();

    [
        FailureKind::Oom,
        FailureKind::Crash,
        FailureKind::Network,
        FailureKind::Build,
    ]
    .into_iter()
    .find(|kind| kind.patterns().iter().any(|p| lowered.contains(p)))
    .map(|kind| {
        let line = logs
            .lines()
            .find(|line| {
                let line = line.to_lowercase();
                kind.patterns().iter().any(|p| line.contains(p))
            })
            .unwrap_or_default()
            .trim()
            .to_string();

        LogFailure { kind, line }
    })
}

/// Whether a failure found in logs is worth an automatic restart.
pub fn is_recoverable(failure: &LogFailure) -> bool {
    failure.kind.is_recoverable()
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Crash => write!(f, "crash"),
            FailureKind::Oom => write!(f, "oom"),
            FailureKind::Network => write!(f, "network"),
            FailureKind::Build => write!(f, "build"),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_logs() {
        let cases = [
            (
                "<--- Last few GCs --->\nFATAL ERROR: JavaScript heap out of memory",
                FailureKind::Oom,
            ),
            ("Segmentation fault (core dumped)", FailureKind::Crash),
            (
                "Error: connect ECONNREFUSED 127.0.0.1:8081",
                FailureKind::Network,
            ),
            (
                "SyntaxError: /app/App.tsx: Unexpected token (12:4)",
                FailureKind::Build,
            ),
            ("error: Unable to resolve module ./Missing", FailureKind::Build),
        ];

        for (logs, expected) in cases {
            let failure = classify_logs(logs).expect("should classify");
            assert_eq!(failure.kind, expected, "logs: {logs}");
        }
    }

    #[test]
    fn test_classify_reports_matching_line() {
        let logs = "Starting Metro Bundler\nwaiting on http://localhost:8081\nError: listen EADDRINUSE: address already in use :::8081\n";
        let failure = classify_logs(logs).unwrap();
        assert_eq!(failure.kind, FailureKind::Network);
        assert_eq!(
            failure.line,
            "Error: listen EADDRINUSE: address already in use :::8081"
        );
    }

    #[test]
    fn test_clean_logs_are_not_classified() {
        assert_eq!(
            classify_logs("Starting Metro Bundler\nLogs for your project will appear below."),
            None
        );
    }

    #[test]
    fn test_recoverability() {
        assert!(FailureKind::Network.is_recoverable());
        assert!(FailureKind::Build.is_recoverable());
        assert!(!FailureKind::Oom.is_recoverable());
        assert!(!FailureKind::Crash.is_recoverable());

        let failure = classify_logs("out of memory").unwrap();
        assert!(!is_recoverable(&failure));
    }
}
