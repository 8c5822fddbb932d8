//! Networking layers for a link.
//!
//! A session never opens sockets itself.  It is handed a byte stream
//! by a [`Connector`], and the [`Connection`](crate::connection::Connection)
//! that owns it consults a [`ReconnectPolicy`] when the stream drops.

pub mod reconnect;
pub mod transport;

pub use reconnect::{Backoff, NoReconnect, ReconnectPolicy};
pub use transport::{BoxTransport, Connector, TcpConnector, Transport};
