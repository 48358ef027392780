pub mod config;
pub mod driver;
pub mod error;
pub mod fabric;
pub mod protocol;
pub mod transport;
pub mod types;

pub use config::RmlConfig;
pub use driver::ProgressDriver;
pub use error::{Result, RmlError};
pub use fabric::mem::{MemNetwork, MemProvider, MemProviderConfig};
pub use transport::{
    ChannelCallback, ChannelEvent, ChannelState, ExceptionHandler, ExceptionKind, FtObserver,
    FtState, InitStatus, QosAttributes, Transport,
};
pub use types::{
    ChannelId, FailureKind, OpKey, OpStatus, PeerMatch, ProcessName, RecvCallback,
    RecvCompletion, SendCallback, SendCompletion, Tag,
};
