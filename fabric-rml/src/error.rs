use crate::fabric::InitStep;
use crate::types::{ChannelId, PeerMatch, ProcessName, Tag};

pub type Result<T> = std::result::Result<T, RmlError>;

#[derive(Debug, thiserror::Error)]
pub enum RmlError {
    #[error("transport is not initialized")]
    NotInitialized,

    #[error("fabric initialization failed at {step}: {reason}")]
    InitFailed { step: InitStep, reason: String },

    #[error("fabric operation {op} failed: {reason}")]
    Fabric { op: &'static str, reason: String },

    #[error("no contact information for peer {peer}")]
    NoContact { peer: ProcessName },

    #[error("a receive for {peer} on tag {tag} is already posted")]
    DuplicateReceive { peer: PeerMatch, tag: Tag },

    #[error("no pending receive for {peer} on tag {tag}")]
    ReceiveNotFound { peer: PeerMatch, tag: Tag },

    #[error("exception handler is already registered")]
    DuplicateException,

    #[error("exception handler is not registered")]
    ExceptionNotRegistered,

    #[error("unknown channel {channel}")]
    UnknownChannel { channel: ChannelId },

    #[error("channel {channel} is not open")]
    ChannelNotOpen { channel: ChannelId },

    #[error("QoS attributes not supported by endpoint: {reason}")]
    QosUnsupported { reason: String },

    #[error("message of {len} bytes exceeds limit of {max} bytes")]
    MessageTooLarge { len: usize, max: usize },

    #[error("invalid contact URI: {0}")]
    InvalidUri(String),

    #[error("endpoint address of {len} bytes exceeds maximum of {max} bytes")]
    InvalidAddress { len: usize, max: usize },

    #[error("internal lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl RmlError {
    /// Create a `Fabric` error for the named fabric operation.
    pub fn fabric(op: &'static str, reason: impl Into<String>) -> Self {
        Self::Fabric {
            op,
            reason: reason.into(),
        }
    }

    /// Create an `InitFailed` error for the given step.
    pub fn init(step: InitStep, reason: impl Into<String>) -> Self {
        Self::InitFailed {
            step,
            reason: reason.into(),
        }
    }

    /// True for errors caused by the caller rather than the fabric.
    pub fn is_usage(&self) -> bool {
        !matches!(
            self,
            RmlError::InitFailed { .. } | RmlError::Fabric { .. } | RmlError::LockPoisoned(_)
        )
    }
}
