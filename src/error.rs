//! Error taxonomy for the kernel.
//!
//! Every fallible kernel operation returns [`KernelError`]. The variants map
//! directly onto the error taxonomy the Gatekeeper and Policy Engine reason
//! about: a `CapacityExceeded` on `stage_context` becomes Gatekeeper feedback
//! that the `L1ViolationHandler` policy can react to next turn, a `NotFound`
//! during staging becomes the fatal feedback that `CriticalErrorHalt`
//! elevates to a halt, and so on.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum KernelError {
    #[error("bad input: {0}")]
    BadInput(String),

    #[error("policy reject: {0}")]
    PolicyReject(String),

    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("io failure: {0}")]
    IoFailure(String),

    #[error("sandbox violation: {0}")]
    SandboxViolation(String),

    #[error("model protocol failure: {0}")]
    ModelProtocolFailure(String),

    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl KernelError {
    /// Render the error as the exact feedback string the Policy Engine's
    /// regex-style matchers expect. Centralizing the wording here keeps the
    /// magic strings out of call sites scattered across the Pager, Session
    /// and Gatekeeper.
    pub fn into_feedback(self) -> String {
        match self {
            KernelError::CapacityExceeded(id) => {
                format!("L1 RAM VIOLATION (FILE:{id} is open)")
            }
            KernelError::NotFound(path) => {
                format!("CRITICAL ERROR: File '{path}' NOT FOUND")
            }
            other => format!("ERROR: {other}"),
        }
    }
}

impl From<std::io::Error> for KernelError {
    fn from(e: std::io::Error) -> Self {
        KernelError::IoFailure(e.to_string())
    }
}

impl From<serde_json::Error> for KernelError {
    fn from(e: serde_json::Error) -> Self {
        KernelError::BadInput(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_exceeded_renders_exact_l1_violation_string() {
        let err = KernelError::CapacityExceeded("notes.md".to_string());
        assert_eq!(
            err.into_feedback(),
            "L1 RAM VIOLATION (FILE:notes.md is open)"
        );
    }

    #[test]
    fn not_found_renders_exact_critical_error_string() {
        let err = KernelError::NotFound("missing.py".to_string());
        assert_eq!(
            err.into_feedback(),
            "CRITICAL ERROR: File 'missing.py' NOT FOUND"
        );
    }
}
