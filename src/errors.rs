use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OperatorError {
    #[error("{kind}: {name:?} not found")]
    NotFound { kind: &'static str, name: String },
    #[error("process already stopped")]
    AlreadyStopped,
    #[error("process already started")]
    AlreadyStarted,
    #[error("failed to spawn {slug}: {source}")]
    Spawn {
        slug: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to signal process {pid}: {message}")]
    Signal { pid: u32, message: String },
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error("wrong upstream format {0:?}, expected remote/branch")]
    WrongUpstream(String),
    #[error("git {command} failed: {message}")]
    Git { command: String, message: String },
    #[error("post-receive hook {hook} failed: {message}")]
    Hook { hook: String, message: String },
    #[error("service unit {0:?} does not exist")]
    ServiceUnitNotFound(String),
    #[error("service manager: {0}")]
    ServiceManager(String),
    #[error("unknown unit status {0:?}")]
    UnknownUnitStatus(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl OperatorError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type OperatorResult<T> = std::result::Result<T, OperatorError>;
