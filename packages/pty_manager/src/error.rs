/// Errors from individual PTY sessions and the registry
#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    /// Opening the PTY pair or starting the shell failed
    #[error("failed to start `{shell}`: {reason}")]
    Spawn { shell: String, reason: String },

    #[error("no PTY session {0}")]
    NotFound(String),

    #[error("failed to write to PTY: {0}")]
    Write(#[from] std::io::Error),

    #[error("failed to resize PTY to {cols}x{rows}: {reason}")]
    Resize { cols: u16, rows: u16, reason: String },

    #[error("failed to hang up shell: {0}")]
    Kill(String),

    /// The session's actor has stopped, normally because its shell exited
    #[error("PTY session has shut down")]
    ActorGone,
}

impl PtyError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, PtyError::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_failure() {
        let err = PtyError::Spawn {
            shell: "/bin/nope".into(),
            reason: "No such file or directory".into(),
        };
        assert_eq!(
            err.to_string(),
            "failed to start `/bin/nope`: No such file or directory"
        );

        let err = PtyError::Resize {
            cols: 0,
            rows: 24,
            reason: "invalid size".into(),
        };
        assert_eq!(err.to_string(), "failed to resize PTY to 0x24: invalid size");
        assert!(PtyError::NotFound("abc".into()).is_not_found());
        assert!(!PtyError::ActorGone.is_not_found());
    }
}
