use thiserror::Error;

#[derive(Error, Debug)]
pub enum IscsiError {
    #[error("A fatal error occured: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Unknown(#[from] anyhow::Error),

    #[error("No such target '{0}' exists.")]
    NoTarget(String),
    #[error("Target '{0}' already exists.")]
    TargetExists(String),
    #[error("No such backstore '{0}' exists.")]
    NoBackstore(String),
    #[error("No {direction} CHAP user '{user}' on target '{target}'.")]
    NoChapUser {
        target: String,
        direction: String,
        user: String,
    },
    #[error("Target '{target}' already has an {direction} CHAP user.")]
    ChapUserExists { target: String, direction: String },
    #[error("CHAP password must be at least {0} characters.")]
    ChapPasswordTooShort(usize),

    #[error("'{0}' is neither a regular file nor a block device.")]
    InvalidPath(String),
    #[error("Expected exactly one new LUN on target '{target}', found {found}.")]
    UnexpectedLunCount { target: String, found: usize },
    #[error("Inconsistent target state: {0}")]
    InconsistentState(String),
    #[error("Backstore for '{0}' could not be created and the path is in use by a LUN.")]
    BackstoreInUse(String),

    #[error("'{command}' failed with exit code {code}: {stderr}")]
    ToolFailure {
        command: String,
        code: i32,
        stderr: String,
    },
    #[error("'{0}' timed out")]
    ToolTimeout(String),
    #[error("Unexpected response from remote host: {0}")]
    RemoteProtocol(String),
    #[error("Timed out waiting for lock '{0}'")]
    LockTimeout(String),
}

impl IscsiError {
    /// True for the "absent" family that callers commonly treat as already satisfied.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            IscsiError::NoTarget(_) | IscsiError::NoBackstore(_) | IscsiError::NoChapUser { .. }
        )
    }
}

/// Classifies an `anyhow` error raised by this crate.
pub fn kind_of(err: &anyhow::Error) -> Option<&IscsiError> {
    err.downcast_ref::<IscsiError>()
}
