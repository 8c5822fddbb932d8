//! Top‑level crate for the link session engine.
//!
//! A link is one persistent connection to one peer over which this
//! node acts as a requester, a responder or both.  Two wire variants
//! are spoken: newline-delimited JSON (v1) and binary frames with
//! multipart splitting and ack-based credit (v2).
//!
//! If you are new to the codebase start with
//! [`connection`](crate::connection), which shows how the pieces fit
//! together: a [`Connection`] drives a [`Session`], the session runs a
//! framer pair over a transport and routes decoded messages to a
//! [`Requester`] and/or a [`Responder`], and both of those hand work
//! to the shared [`Scheduler`].

pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod network;
pub mod protocol;
pub mod requester;
pub mod responder;
pub mod scheduler;
pub mod session;
pub mod tree;

pub use config::LinkConfig;
pub use connection::{Connection, ConnectionState};
pub use error::{ErrorType, LinkError};
pub use requester::{Requester, ResponseHandler, SubscriptionHandler};
pub use responder::Responder;
pub use scheduler::Scheduler;
pub use session::Session;
pub use tree::{MemoryTree, ValueTree};
