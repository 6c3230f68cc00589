use std::error::Error as StdError;

/// Crate-wide result type for channel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Typed channel errors shared across the adapter traits.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Input payload or parameter is invalid.
    #[error("invalid channel input: {message}")]
    InvalidInput { message: String },

    /// A requested account ID is not configured for the channel.
    #[error("unknown channel account: {account_id}")]
    UnknownAccount { account_id: String },

    /// No plugin is registered under this id or alias.
    #[error("unknown channel: {channel}")]
    UnknownChannel { channel: String },

    /// Operation is currently unavailable (not configured/ready).
    #[error("channel operation unavailable: {message}")]
    Unavailable { message: String },

    /// The adapter does not implement this optional method.
    #[error("channel capability not supported: {capability}")]
    Unsupported { capability: &'static str },

    /// Destination is missing or rejected by the allow-list.
    #[error("target not allowed: {target}")]
    TargetNotAllowed { target: String },

    /// Wrapped source error from an external dependency.
    #[error("channel operation failed: {context}: {source}")]
    External {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    /// JSON (de)serialization failed.
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
}

impl Error {
    #[must_use]
    pub fn invalid_input(message: impl std::fmt::Display) -> Self {
        Self::InvalidInput {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn unavailable(message: impl std::fmt::Display) -> Self {
        Self::Unavailable {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn unknown_account(account_id: impl std::fmt::Display) -> Self {
        Self::UnknownAccount {
            account_id: account_id.to_string(),
        }
    }

    #[must_use]
    pub fn unknown_channel(channel: impl std::fmt::Display) -> Self {
        Self::UnknownChannel {
            channel: channel.to_string(),
        }
    }

    #[must_use]
    pub fn unsupported(capability: &'static str) -> Self {
        Self::Unsupported { capability }
    }

    #[must_use]
    pub fn target_not_allowed(target: impl std::fmt::Display) -> Self {
        Self::TargetNotAllowed {
            target: target.to_string(),
        }
    }

    #[must_use]
    pub fn external(
        context: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::External {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// True for the "adapter left this optional method out" case.
    #[must_use]
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }
}
