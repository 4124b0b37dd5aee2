//! Client-Facing Proxy Server
//!
//! - `protocol`: JSON request and push frames
//! - `connection`: per-socket authentication, reader and writer
//! - `event_loop`: the single owner of routing state
//! - `listener`: TCP accept loop

mod connection;
mod event_loop;
mod listener;
pub mod protocol;

pub use connection::{ConnectionContext, ConnectionError, ServerCommand, handle_client};
pub use event_loop::{ChannelCore, EventLoop};
pub use listener::{ProxyServer, ServerError};
pub use protocol::{ClientRequest, ErrorCode, ProtocolError, ServerFrame};
