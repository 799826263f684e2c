//! Portway Shared Library
//!
//! Wire protocol, connection bookkeeping and the control-channel sender
//! used by both the relay and the client.

pub mod channel;
pub mod error;
pub mod frame;
pub mod protocol;
pub mod table;

pub use channel::{ControlSender, Outbound};
pub use error::{Error, Result};
pub use frame::BinaryFrame;
pub use protocol::{ControlMessage, HttpRequest, HttpResponse, TunnelType};
pub use table::ConnectionTable;
