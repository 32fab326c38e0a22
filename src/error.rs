//! Unified error type for the analyzer.
//!
//! `AppError` is the single error type crossing the crate boundary. It
//! serializes as `{ "kind": "...", "message": "..." }` so feed consumers can
//! programmatically distinguish error categories.

use serde::ser::SerializeStruct;

/// Analyzer-level error.
///
/// Each variant maps to a distinct failure domain. Consumers receive a JSON
/// object with `kind` (variant name) and `message` (human-readable description).
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Errors from the capture backend (device open, BPF compile, sniff loop).
    #[error("{0}")]
    Capture(String),

    /// Errors from the HTTPS interception proxy.
    #[error("{0}")]
    Proxy(String),

    /// Decode and parse errors (capture files, wire formats, JSON).
    #[error("{0}")]
    Decode(String),

    /// I/O and OS-level errors (socket tables, certificate files).
    #[error("{0}")]
    Io(String),

    /// Invalid or missing caller input (unknown PID, malformed filter).
    #[error("{0}")]
    InvalidInput(String),
}

impl AppError {
    /// Returns the error kind as a string matching the variant name.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Capture(_) => "Capture",
            AppError::Proxy(_) => "Proxy",
            AppError::Decode(_) => "Decode",
            AppError::Io(_) => "Io",
            AppError::InvalidInput(_) => "InvalidInput",
        }
    }
}

/// Custom Serialize: produces `{ "kind": "Variant", "message": "..." }`.
impl serde::Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut s = serializer.serialize_struct("AppError", 2)?;
        s.serialize_field("kind", self.kind())?;
        s.serialize_field("message", &self.to_string())?;
        s.end()
    }
}

// ---- From implementations for ergonomic error conversion ----

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Io(err.to_string())
    }
}

impl From<pcap::Error> for AppError {
    fn from(err: pcap::Error) -> Self {
        AppError::Capture(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Decode(err.to_string())
    }
}
