pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Channel(#[from] switchboard_channels::Error),

    /// The request cannot be routed to a channel capability. Raised before
    /// any backend I/O.
    #[error("routing error: {message}")]
    Routing { message: String },

    #[error("poll has {options} options but {channel} allows at most {max}")]
    PollTooLarge {
        channel: String,
        options: usize,
        max: usize,
    },

    /// No text, media or poll. Raised before any backend I/O.
    #[error("reply to {channel} has nothing to send")]
    EmptyReply { channel: String },

    #[error("config error: {message}")]
    Config { message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    #[must_use]
    pub fn routing(message: impl std::fmt::Display) -> Self {
        Self::Routing {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn config(message: impl std::fmt::Display) -> Self {
        Self::Config {
            message: message.to_string(),
        }
    }
}
