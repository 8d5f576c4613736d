use std::io;

/// Errors from preview sandbox operations.
///
/// Backends should map their internal errors into these variants.
/// `NotFound` doubles as the lookup miss for status/extend/destroy paths,
/// so API handlers can turn it into a 404 without inspecting strings.
#[derive(thiserror::Error, Debug)]
pub enum SandboxError {
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("no preview found: {0}")]
    NotFound(String),

    #[error("provision failed: {0}")]
    Provision(String),

    #[error("exec failed: {0}")]
    Exec(String),

    #[error("invalid project file path: {0}")]
    InvalidPath(String),

    #[error("capacity exhausted: {0}")]
    CapacityExhausted(String),

    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("serialization: {0}")]
    Serde(String),

    #[error("backend error: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_displays_message() {
        let err = SandboxError::Unsupported("checkpoint");
        assert_eq!(err.to_string(), "unsupported operation: checkpoint");
    }

    #[test]
    fn not_found_displays_project() {
        let err = SandboxError::NotFound("proj-123".into());
        assert_eq!(err.to_string(), "no preview found: proj-123");
    }

    #[test]
    fn invalid_path_displays_offender() {
        let err = SandboxError::InvalidPath("../etc/passwd".into());
        assert_eq!(err.to_string(), "invalid project file path: ../etc/passwd");
    }

    #[test]
    fn io_error_converts_via_from() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file missing");
        let err: SandboxError = io_err.into();
        assert!(err.to_string().contains("file missing"));
        assert!(matches!(err, SandboxError::Io(_)));
    }

    #[test]
    fn provision_exec_serde_backend_display() {
        assert_eq!(
            SandboxError::Provision("no free port".into()).to_string(),
            "provision failed: no free port"
        );
        assert_eq!(
            SandboxError::Exec("dev server died".into()).to_string(),
            "exec failed: dev server died"
        );
        assert_eq!(
            SandboxError::Serde("bad json".into()).to_string(),
            "serialization: bad json"
        );
        assert_eq!(
            SandboxError::Backend("connection refused".into()).to_string(),
            "backend error: connection refused"
        );
    }

    #[test]
    fn capacity_exhausted_displays() {
        let err = SandboxError::CapacityExhausted("20 previews active".into());
        assert_eq!(err.to_string(), "capacity exhausted: 20 previews active");
    }

    #[test]
    fn error_is_send_and_sync() {
        // SandboxError must be Send + Sync for use in async trait returns
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SandboxError>();
    }
}
