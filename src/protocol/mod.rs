//! Wire protocol.
//!
//! This module groups the message model shared by both wire variants
//! and the framing that carries it.  `message` defines what a session
//! routes; `text` and `frame` are the v1 and v2 physical formats;
//! `multipart` and `ack` hold the v2 reassembly and flow-control state;
//! `framer` selects between the variants once per session.

pub mod ack;
pub mod frame;
pub mod framer;
pub mod message;
pub mod multipart;
pub mod text;

pub use ack::AckWindow;
pub use frame::{Frame, FrameHeaders, MessageType};
pub use framer::{FrameDecoder, FrameEncoder, Framer};
pub use message::{
    validate_path, Inbound, Message, Method, Permission, Request, RequestId, Response,
    StreamState, SubscribePath, SubscriptionId, SubscriptionUpdate, ValueStatus, ValueUpdate,
    WireMessage, UPDATE_RID,
};
