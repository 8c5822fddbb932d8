//! Per-session framing.
//!
//! [`Framer::new`] picks the wire variant once, when a session is
//! bound, and returns a decoder for the reader task and an encoder for
//! the writer task.  Everything above this layer deals in [`Message`]
//! values and never looks at the protocol version again.
//!
//! For v2 the two halves share one [`AckWindow`]: the decoder records
//! inbound sequence numbers and the peer's acks, the encoder takes
//! sequence numbers for outgoing frames and piggybacks our ack on
//! every one of them.  The encoder also tells the decoder about every
//! stream it closes, so a response still arriving in parts for that
//! stream is abandoned instead of delivered.

use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::ack::AckWindow;
use super::frame::{Frame, MessageType};
use super::message::{Inbound, Message, Method, RequestId, WireMessage};
use super::multipart::{self, Reassembler};
use super::text::{TextDecoder, TextEncoder};
use crate::codec::Codec;
use crate::config::{LinkConfig, ProtocolVersion};
use crate::error::{FrameError, SessionError};

/// A v1 line may hold this many times `max_frame_size` bytes.
const TEXT_LINE_FACTOR: usize = 16;

pub struct Framer;

impl Framer {
    pub fn new(config: &LinkConfig, codec: Arc<dyn Codec>) -> (FrameDecoder, FrameEncoder) {
        match config.protocol {
            ProtocolVersion::V1 => {
                let max_line = config.max_frame_size.saturating_mul(TEXT_LINE_FACTOR);
                (
                    FrameDecoder::Text(TextDecoder::new(max_line)),
                    FrameEncoder::Text(TextEncoder),
                )
            }
            ProtocolVersion::V2 => {
                let window = Arc::new(AckWindow::new(config.ack_window, config.window_violation));
                let (closed_tx, closed_rx) = mpsc::unbounded_channel();
                (
                    FrameDecoder::Binary(BinaryDecoder {
                        buf: Vec::new(),
                        max_body: config.max_frame_size,
                        codec: codec.clone(),
                        window: window.clone(),
                        reassembler: Reassembler::new(),
                        closed: closed_rx,
                    }),
                    FrameEncoder::Binary(BinaryEncoder {
                        max_body: config.max_frame_size,
                        codec,
                        window,
                        closed: closed_tx,
                    }),
                )
            }
        }
    }
}

pub enum FrameDecoder {
    Text(TextDecoder),
    Binary(BinaryDecoder),
}

impl FrameDecoder {
    pub fn feed(&mut self, bytes: &[u8]) {
        match self {
            FrameDecoder::Text(dec) => dec.feed(bytes),
            FrameDecoder::Binary(dec) => dec.buf.extend_from_slice(bytes),
        }
    }

    /// Next complete inbound item, or `Ok(None)` when more bytes are
    /// needed.  Recoverable errors consume the offending frame, so the
    /// caller may log them and call again.
    pub fn next_inbound(&mut self) -> Result<Option<Inbound>, FrameError> {
        match self {
            FrameDecoder::Text(dec) => dec.next_inbound(),
            FrameDecoder::Binary(dec) => dec.next_inbound(),
        }
    }
}

pub struct BinaryDecoder {
    buf: Vec<u8>,
    max_body: usize,
    codec: Arc<dyn Codec>,
    window: Arc<AckWindow>,
    reassembler: Reassembler,
    closed: mpsc::UnboundedReceiver<RequestId>,
}

impl BinaryDecoder {
    fn next_inbound(&mut self) -> Result<Option<Inbound>, FrameError> {
        loop {
            let Some((frame, used)) = Frame::decode(&self.buf, self.max_body)? else {
                return Ok(None);
            };
            self.buf.drain(..used);
            trace!(
                kind = frame.message_type.code(),
                rid = frame.rid,
                ack = frame.ack,
                len = frame.body.len(),
                "decoded binary frame"
            );

            self.window.on_peer_ack(frame.ack)?;
            if frame.message_type.consumes_credit() {
                let seq = frame
                    .headers
                    .seq
                    .ok_or_else(|| FrameError::Codec("frame without sequence header".into()))?;
                self.window.on_received(seq)?;
            }

            while let Ok(rid) = self.closed.try_recv() {
                self.reassembler.abandon((false, rid));
            }
            match frame.message_type {
                MessageType::Ack => continue,
                MessageType::Ping => return Ok(Some(Inbound::Message(Message::Ping))),
                MessageType::Unknown(code) => return Err(FrameError::UnknownType(code)),
                MessageType::Request(Method::Close) => {
                    self.reassembler.discard((true, frame.rid));
                }
                _ => {}
            }

            let Some(frame) = self.reassembler.push(frame)? else {
                continue;
            };
            return self.to_inbound(frame).map(Some);
        }
    }

    fn to_inbound(&self, frame: Frame) -> Result<Inbound, FrameError> {
        let mut wire = if frame.body.is_empty() {
            WireMessage::default()
        } else {
            serde_json::from_value::<WireMessage>(self.codec.decode(&frame.body)?)?
        };
        wire.rid = Some(frame.rid);
        if let MessageType::Request(method) = frame.message_type {
            wire.method = Some(method.as_str().to_string());
        }
        wire.path = frame.headers.path;
        wire.permit = frame.headers.permit;
        wire.stream = frame.headers.status;
        if let (Some(qos), Some(paths)) = (frame.headers.qos, wire.paths.as_mut()) {
            for entry in paths {
                entry.qos = qos;
            }
        }
        wire.into_inbound()
    }

    #[cfg(test)]
    fn in_progress(&self) -> usize {
        self.reassembler.in_progress()
    }
}

/// A subscribe batch whose entries all ask for the same qos carries it
/// once, in the header, instead of on every entry.
fn shared_qos(wire: &mut WireMessage) -> Option<u8> {
    let paths = wire.paths.as_mut()?;
    let qos = paths.first()?.qos;
    if qos == 0 || paths.iter().any(|entry| entry.qos != qos) {
        return None;
    }
    for entry in paths.iter_mut() {
        entry.qos = 0;
    }
    Some(qos)
}

pub enum FrameEncoder {
    Text(TextEncoder),
    Binary(BinaryEncoder),
}

impl FrameEncoder {
    /// Write one message, waiting for credit between v2 frames as
    /// needed.  While blocked on credit, explicit acks are still sent.
    pub async fn write_message<W>(&self, msg: &Message, out: &mut W) -> Result<(), SessionError>
    where
        W: AsyncWrite + Unpin,
    {
        match self {
            FrameEncoder::Text(enc) => {
                out.write_all(&enc.encode(msg)?).await?;
            }
            FrameEncoder::Binary(enc) => {
                for frame in enc.split(msg)? {
                    let seq = loop {
                        if let Some(seq) = enc.window.next_ack() {
                            break seq;
                        }
                        debug!(in_flight = enc.window.in_flight(), "waiting for credit");
                        tokio::select! {
                            _ = enc.window.credit_granted() => {}
                            _ = enc.window.ack_due() => {
                                out.write_all(&enc.ack_frame()).await?;
                                out.flush().await?;
                            }
                        }
                    };
                    out.write_all(&enc.seal(frame, Some(seq))).await?;
                }
            }
        }
        out.flush().await?;
        Ok(())
    }

    /// Resolves when an explicit ack should go out.  Never resolves
    /// for v1, which has no acks.
    pub async fn ack_due(&self) {
        match self {
            FrameEncoder::Text(_) => std::future::pending::<()>().await,
            FrameEncoder::Binary(enc) => enc.window.ack_due().await,
        }
    }

    /// Send an explicit ack if anything arrived since the last one.
    pub async fn write_pending_ack<W>(&self, out: &mut W) -> Result<(), SessionError>
    where
        W: AsyncWrite + Unpin,
    {
        if let FrameEncoder::Binary(enc) = self {
            if enc.window.ack_pending() {
                out.write_all(&enc.ack_frame()).await?;
                out.flush().await?;
            }
        }
        Ok(())
    }

    pub fn ack_window(&self) -> Option<&Arc<AckWindow>> {
        match self {
            FrameEncoder::Text(_) => None,
            FrameEncoder::Binary(enc) => Some(&enc.window),
        }
    }
}

pub struct BinaryEncoder {
    max_body: usize,
    codec: Arc<dyn Codec>,
    window: Arc<AckWindow>,
    closed: mpsc::UnboundedSender<RequestId>,
}

impl BinaryEncoder {
    /// Turn a message into one or more unsealed frames.  Routing fields
    /// travel as headers; the rest is the codec-encoded body.
    pub fn split(&self, msg: &Message) -> Result<Vec<Frame>, FrameError> {
        let mut wire = WireMessage::from(msg);
        let mut template = match msg {
            Message::Ping => return Ok(vec![Frame::new(MessageType::Ping, 0)]),
            Message::Request(req) => {
                if req.method == Method::Close {
                    let _ = self.closed.send(req.rid);
                }
                Frame::new(MessageType::Request(req.method), req.rid)
            }
            Message::Response(resp) => Frame::new(MessageType::Response, resp.rid),
        };
        template.headers.path = wire.path.take();
        template.headers.permit = wire.permit.take();
        template.headers.status = wire.stream.take();
        template.headers.qos = shared_qos(&mut wire);
        wire.rid = None;
        wire.method = None;

        let body = if wire.is_empty() {
            Vec::new()
        } else {
            let value: Value = serde_json::to_value(&wire)
                .map_err(|err| FrameError::Codec(err.to_string()))?;
            self.codec.encode(&value)?
        };
        Ok(multipart::split(template, body, self.max_body))
    }

    /// Stamp the sequence number and our current ack onto a frame and
    /// encode it.
    pub fn seal(&self, mut frame: Frame, seq: Option<u32>) -> Vec<u8> {
        frame.headers.seq = seq;
        frame.ack = self.window.ack_to_send();
        self.window.mark_ack_sent(frame.ack);
        frame.encode()
    }

    pub fn ack_frame(&self) -> Vec<u8> {
        self.seal(Frame::new(MessageType::Ack, 0), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::config::WindowViolationPolicy;
    use crate::protocol::message::{Request, Response, StreamState, SubscribePath};
    use serde_json::json;
    use std::time::Duration;

    fn config(version: ProtocolVersion, max: usize, window: u32) -> LinkConfig {
        LinkConfig {
            protocol: version,
            max_frame_size: max,
            ack_window: window,
            window_violation: WindowViolationPolicy::Disconnect,
            ..LinkConfig::default()
        }
    }

    fn pair(cfg: &LinkConfig) -> (FrameDecoder, FrameEncoder) {
        Framer::new(cfg, Arc::new(JsonCodec))
    }

    fn big_invoke(rid: u32, len: usize) -> Message {
        let mut req = Request::new(rid, Method::Invoke).with_path("/node/action");
        req.params = Some(json!({ "blob": "x".repeat(len) }));
        Message::Request(req)
    }

    fn drain(dec: &mut FrameDecoder) -> Vec<Inbound> {
        let mut out = Vec::new();
        while let Some(item) = dec.next_inbound().unwrap() {
            out.push(item);
        }
        out
    }

    #[tokio::test]
    async fn binary_messages_survive_splitting() {
        let cfg = config(ProtocolVersion::V2, 64, 64);
        let (_, enc) = pair(&cfg);
        let (mut dec, _) = pair(&cfg);

        let first = big_invoke(1, 700);
        let mut resp = Response::new(2, StreamState::Open);
        resp.updates = vec![json!(["a", {"$is": "node"}])];
        let second = Message::Response(resp);

        let mut bytes = Vec::new();
        enc.write_message(&first, &mut bytes).await.unwrap();
        enc.write_message(&second, &mut bytes).await.unwrap();

        for chunk in bytes.chunks(5) {
            dec.feed(chunk);
        }
        let items = drain(&mut dec);
        assert_eq!(
            items,
            vec![Inbound::Message(first), Inbound::Message(second)]
        );
    }

    #[tokio::test]
    async fn every_frame_carries_a_sequence() {
        let cfg = config(ProtocolVersion::V2, 32, 64);
        let (_, enc) = pair(&cfg);
        let mut bytes = Vec::new();
        enc.write_message(&big_invoke(9, 100), &mut bytes).await.unwrap();

        let mut seqs = Vec::new();
        let mut rest = &bytes[..];
        while let Some((frame, used)) = Frame::decode(rest, 32).unwrap() {
            assert_eq!(frame.rid, 9);
            seqs.push(frame.headers.seq.unwrap());
            rest = &rest[used..];
        }
        assert!(seqs.len() > 3);
        assert_eq!(seqs, (1..=seqs.len() as u32).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn writer_pauses_when_credit_runs_out() {
        let cfg = config(ProtocolVersion::V2, 32, 2);
        let (_, enc) = pair(&cfg);
        let mut bytes = Vec::new();
        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            enc.write_message(&big_invoke(1, 200), &mut bytes),
        )
        .await;
        assert!(blocked.is_err());
        assert_eq!(enc.ack_window().unwrap().in_flight(), 2);
    }

    #[tokio::test]
    async fn close_discards_a_partial_request() {
        let cfg = config(ProtocolVersion::V2, 32, 64);
        let (_, enc) = pair(&cfg);
        let (mut dec, _) = pair(&cfg);
        let FrameEncoder::Binary(bin) = &enc else {
            panic!("expected binary encoder");
        };

        let frames = bin.split(&big_invoke(4, 200)).unwrap();
        let mut bytes = Vec::new();
        for frame in frames.into_iter().take(2) {
            let seq = bin.window.next_ack().unwrap();
            bytes.extend(bin.seal(frame, Some(seq)));
        }
        dec.feed(&bytes);
        assert!(drain(&mut dec).is_empty());
        let FrameDecoder::Binary(inner) = &dec else {
            panic!("expected binary decoder");
        };
        assert_eq!(inner.in_progress(), 1);

        let mut close = Vec::new();
        enc.write_message(&Message::Request(Request::close(4)), &mut close)
            .await
            .unwrap();
        dec.feed(&close);
        assert_eq!(
            drain(&mut dec),
            vec![Inbound::Message(Message::Request(Request::close(4)))]
        );
        let FrameDecoder::Binary(inner) = &dec else {
            panic!("expected binary decoder");
        };
        assert_eq!(inner.in_progress(), 0);
    }

    #[tokio::test]
    async fn closing_a_stream_abandons_its_partial_response() {
        let cfg = config(ProtocolVersion::V2, 32, 64);
        let (mut dec, enc) = pair(&cfg);
        let (_, peer) = pair(&cfg);

        let big = Response::new(4, StreamState::Open).with_updates(vec![json!("x".repeat(300))]);
        let mut bytes = Vec::new();
        peer.write_message(&Message::Response(big), &mut bytes).await.unwrap();
        let (_, first) = Frame::decode(&bytes, 32).unwrap().unwrap();
        dec.feed(&bytes[..first]);
        assert!(drain(&mut dec).is_empty());

        let mut sink = Vec::new();
        enc.write_message(&Message::Request(Request::close(4)), &mut sink)
            .await
            .unwrap();
        dec.feed(&bytes[first..]);
        assert!(drain(&mut dec).is_empty());
        let FrameDecoder::Binary(inner) = &dec else {
            panic!("expected binary decoder");
        };
        assert_eq!(inner.in_progress(), 0);
    }

    #[tokio::test]
    async fn uniform_subscribe_qos_travels_in_the_header() {
        let cfg = config(ProtocolVersion::V2, 256, 64);
        let (mut dec, enc) = pair(&cfg);
        let FrameEncoder::Binary(bin) = &enc else {
            panic!("expected binary encoder");
        };
        let entry = |sid, qos| SubscribePath {
            path: format!("/p{sid}"),
            sid,
            qos,
        };

        let mut uniform = Request::new(1, Method::Subscribe);
        uniform.paths = vec![entry(1, 2), entry(2, 2)];
        let mut mixed = Request::new(2, Method::Subscribe);
        mixed.paths = vec![entry(3, 0), entry(4, 1)];

        let frames = bin.split(&Message::Request(uniform.clone())).unwrap();
        assert_eq!(frames[0].headers.qos, Some(2));
        let frames = bin.split(&Message::Request(mixed.clone())).unwrap();
        assert_eq!(frames[0].headers.qos, None);

        let mut bytes = Vec::new();
        enc.write_message(&Message::Request(uniform.clone()), &mut bytes).await.unwrap();
        enc.write_message(&Message::Request(mixed.clone()), &mut bytes).await.unwrap();
        dec.feed(&bytes);
        assert_eq!(
            drain(&mut dec),
            vec![
                Inbound::Message(Message::Request(uniform)),
                Inbound::Message(Message::Request(mixed)),
            ]
        );
    }

    #[tokio::test]
    async fn unknown_frame_type_is_skipped() {
        let cfg = config(ProtocolVersion::V2, 64, 8);
        let (mut dec, _) = pair(&cfg);

        let mut odd = Frame::new(MessageType::Unknown(0x42), 3);
        odd.headers.seq = Some(1);
        let mut ping = Frame::new(MessageType::Ping, 0);
        ping.headers.seq = Some(2);
        dec.feed(&odd.encode());
        dec.feed(&ping.encode());

        let err = dec.next_inbound().unwrap_err();
        assert!(matches!(err, FrameError::UnknownType(0x42)));
        assert!(!err.is_fatal());
        assert_eq!(
            dec.next_inbound().unwrap(),
            Some(Inbound::Message(Message::Ping))
        );
    }

    #[tokio::test]
    async fn sequence_gap_is_fatal() {
        let cfg = config(ProtocolVersion::V2, 64, 8);
        let (mut dec, _) = pair(&cfg);
        let mut ping = Frame::new(MessageType::Ping, 0);
        ping.headers.seq = Some(2);
        dec.feed(&ping.encode());
        assert!(dec.next_inbound().unwrap_err().is_fatal());
    }

    #[tokio::test]
    async fn pending_ack_is_written_once() {
        let cfg = config(ProtocolVersion::V2, 64, 8);
        let (mut dec, enc) = pair(&cfg);
        let mut ping = Frame::new(MessageType::Ping, 0);
        ping.headers.seq = Some(1);
        dec.feed(&ping.encode());
        drain(&mut dec);

        let mut out = Vec::new();
        enc.write_pending_ack(&mut out).await.unwrap();
        let (frame, _) = Frame::decode(&out, 64).unwrap().unwrap();
        assert_eq!(frame.message_type, MessageType::Ack);
        assert_eq!(frame.ack, 1);
        assert_eq!(frame.headers.seq, None);

        let mut again = Vec::new();
        enc.write_pending_ack(&mut again).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn text_variant_is_line_per_message() {
        let cfg = config(ProtocolVersion::V1, 64, 8);
        let (mut dec, enc) = pair(&cfg);
        let msg = big_invoke(2, 300);
        let mut bytes = Vec::new();
        enc.write_message(&msg, &mut bytes).await.unwrap();
        enc.write_message(&Message::Ping, &mut bytes).await.unwrap();
        assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 2);

        dec.feed(&bytes);
        assert_eq!(
            drain(&mut dec),
            vec![Inbound::Message(msg), Inbound::Message(Message::Ping)]
        );
        assert!(enc.ack_window().is_none());
    }
}
