use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("gateway binary not found: {name}")]
    BinaryNotFound { name: String },

    #[error("gateway lock {path} is held by pid {pid}")]
    AlreadyLocked { path: PathBuf, pid: u32 },

    #[error("a gateway is already running with pid {pid}")]
    AlreadyRunning { pid: u32 },

    #[error("{0}")]
    Message(String),
}

impl Error {
    #[must_use]
    pub fn message(message: impl std::fmt::Display) -> Self {
        Self::Message(message.to_string())
    }
}
