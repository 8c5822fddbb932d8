//! A session binds one framer pair, plus a requester and/or a
//! responder, to a transport.
//!
//! Starting a session spawns exactly two tasks.  The reader owns the
//! read half and the decoder; it dispatches every decoded item inline,
//! in arrival order, so responses and requests are never processed
//! concurrently with each other.  The writer owns the write half and
//! the encoder and drains a single queue that every producer
//! (requester, responder, subscription flushes, keepalives) feeds
//! through an [`Outbound`] handle.
//!
//! Either task reports why it stopped on the session's disconnect
//! channel; the owning [`Connection`](crate::connection::Connection)
//! reacts by tearing the session down and calling
//! [`Session::on_disconnect`].

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::codec::{Codec, JsonCodec};
use crate::config::LinkConfig;
use crate::error::{LinkError, SessionError};
use crate::network::Transport;
use crate::protocol::{
    FrameDecoder, FrameEncoder, Framer, Inbound, Message, Method, RequestId, Response,
};
use crate::requester::Requester;
use crate::responder::Responder;

const READ_CHUNK: usize = 8 * 1024;

/// Queue into the session writer.  Cloning is cheap.
#[derive(Clone, Debug)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<Message>,
}

impl Outbound {
    pub fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self { tx }
    }

    /// Queue a message.  Fails once the writer has gone away.
    pub fn send(&self, msg: Message) -> Result<(), SessionError> {
        self.tx.send(msg).map_err(|_| SessionError::NotConnected)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Why a session stopped.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DisconnectReason {
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("no data received within the read timeout")]
    ReadTimeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("stopped locally")]
    Stopped,
}

impl From<&SessionError> for DisconnectReason {
    fn from(err: &SessionError) -> Self {
        match err {
            SessionError::Frame(frame) => DisconnectReason::Protocol(frame.to_string()),
            other => DisconnectReason::Transport(other.to_string()),
        }
    }
}

/// The running halves of a started session.
pub struct SessionTasks {
    pub reader: JoinHandle<()>,
    pub writer: JoinHandle<()>,
    pub outbound: Outbound,
    /// Receives the first reason either task stopped for.
    pub disconnected: mpsc::UnboundedReceiver<DisconnectReason>,
}

pub struct Session {
    config: LinkConfig,
    codec: Arc<dyn Codec>,
    requester: Option<Requester>,
    responder: Option<Responder>,
}

impl Session {
    /// A session acting as requester, responder or both.
    pub fn new(config: LinkConfig, requester: Option<Requester>, responder: Option<Responder>) -> Self {
        Self {
            config,
            codec: Arc::new(JsonCodec),
            requester,
            responder,
        }
    }

    /// Replace the v2 body codec.
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn requester(&self) -> Option<&Requester> {
        self.requester.as_ref()
    }

    pub fn responder(&self) -> Option<&Responder> {
        self.responder.as_ref()
    }

    /// Bind the session to `transport`.  The requester and responder
    /// are connected before the reader starts, so the first inbound
    /// frame already finds them bound.
    pub fn start<T: Transport>(&self, transport: T) -> SessionTasks {
        let (decoder, encoder) = Framer::new(&self.config, self.codec.clone());
        let (read_half, write_half) = tokio::io::split(transport);
        let (tx, rx) = mpsc::unbounded_channel();
        let outbound = Outbound::new(tx);
        let (done_tx, done_rx) = mpsc::unbounded_channel();

        if let Some(requester) = &self.requester {
            requester.on_connect(outbound.clone());
        }
        if let Some(responder) = &self.responder {
            responder.on_connect(outbound.clone());
        }

        let writer = tokio::spawn(write_loop(write_half, encoder, rx, done_tx.clone()));
        let router = Router {
            requester: self.requester.clone(),
            responder: self.responder.clone(),
            outbound: outbound.clone(),
        };
        let reader = tokio::spawn(read_loop(
            read_half,
            decoder,
            router,
            self.config.read_timeout(),
            done_tx,
        ));
        debug!(protocol = ?self.config.protocol, "session started");

        SessionTasks {
            reader,
            writer,
            outbound,
            disconnected: done_rx,
        }
    }

    /// Close every stream, inbound context and subscription on both
    /// sides.  Runs to completion before returning.
    pub fn on_disconnect(&self) {
        if let Some(requester) = &self.requester {
            requester.on_disconnect();
        }
        if let Some(responder) = &self.responder {
            responder.on_disconnect();
        }
    }
}

/// Routes decoded items to the side that owns them.
struct Router {
    requester: Option<Requester>,
    responder: Option<Responder>,
    outbound: Outbound,
}

impl Router {
    fn dispatch(&self, item: Inbound) {
        match item {
            Inbound::Message(Message::Ping) => trace!("keepalive received"),
            Inbound::Message(Message::Response(resp)) => match &self.requester {
                Some(requester) => requester.handle_response(resp),
                None => debug!(rid = resp.rid, "response ignored; no requester"),
            },
            Inbound::Message(Message::Request(req)) => match &self.responder {
                Some(responder) => responder.handle_request(req),
                None if req.method == Method::Close => {}
                None => self.refuse(
                    req.rid,
                    LinkError::not_implemented("this link does not serve requests"),
                ),
            },
            Inbound::Rejected { rid, error } => match &self.responder {
                Some(responder) => responder.reject(rid, error),
                None => self.refuse(rid, error),
            },
        }
    }

    fn refuse(&self, rid: RequestId, error: LinkError) {
        let _ = self.outbound.send(Message::Response(Response::error(rid, error)));
    }
}

async fn read_loop<R>(
    mut reader: R,
    mut decoder: FrameDecoder,
    router: Router,
    read_timeout: Option<Duration>,
    done: mpsc::UnboundedSender<DisconnectReason>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let read = match read_timeout {
            Some(limit) => match tokio::time::timeout(limit, reader.read(&mut buf)).await {
                Ok(read) => read,
                Err(_) => {
                    warn!(?limit, "read timed out");
                    let _ = done.send(DisconnectReason::ReadTimeout);
                    return;
                }
            },
            None => reader.read(&mut buf).await,
        };
        let n = match read {
            Ok(0) => {
                debug!("peer closed the connection");
                let _ = done.send(DisconnectReason::PeerClosed);
                return;
            }
            Ok(n) => n,
            Err(err) => {
                warn!(error = %err, "transport read failed");
                let _ = done.send(DisconnectReason::Transport(err.to_string()));
                return;
            }
        };
        decoder.feed(&buf[..n]);

        loop {
            match decoder.next_inbound() {
                Ok(Some(item)) => router.dispatch(item),
                Ok(None) => break,
                Err(err) if err.is_fatal() => {
                    error!(error = %err, "fatal framing error");
                    let _ = done.send(DisconnectReason::Protocol(err.to_string()));
                    return;
                }
                Err(err) => warn!(error = %err, "skipping undecodable frame"),
            }
        }
    }
}

async fn write_loop<W>(
    mut writer: W,
    encoder: FrameEncoder,
    mut queue: mpsc::UnboundedReceiver<Message>,
    done: mpsc::UnboundedSender<DisconnectReason>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let result = tokio::select! {
            msg = queue.recv() => match msg {
                Some(msg) => encoder.write_message(&msg, &mut writer).await,
                None => {
                    debug!("outbound queue closed");
                    return;
                }
            },
            _ = encoder.ack_due() => encoder.write_pending_ack(&mut writer).await,
        };
        if let Err(err) = result {
            warn!(error = %err, "transport write failed");
            let _ = done.send(DisconnectReason::from(&err));
            return;
        }
    }
}
