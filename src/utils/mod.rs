pub mod error;

pub use error::{
    CommandError, ConfigError, FrameError, MonitorError, ProtocolError, ScoringError, SinkError,
    TransportError,
};
#[cfg(feature = "sqlite")]
pub use error::StorageError;
