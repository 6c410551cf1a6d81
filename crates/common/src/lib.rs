//! Stepwise Common Library
//!
//! Shared types, driver manifests and the driver protocol client.

pub mod error;
pub mod manifest;
pub mod protocol;
pub mod types;

// Re-export commonly used types
pub use error::{Error, ErrorDetail, ParseError, ProtocolError, ProtocolErrorKind, Result};
pub use manifest::{load_descriptor, DriverManifest, MANIFEST_FILE};
pub use protocol::{BoxedReader, BoxedWriter, DriverClient, DriverEvent, Message, MessageType};
pub use types::*;

/// Stepwise version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
