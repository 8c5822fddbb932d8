//! Multipart reassembly for v2.
//!
//! A payload larger than the maximum frame size is sent as a primary
//! frame followed by continuation frames with the same request id.
//! Every member carries the declared total length.  The reader buffers
//! the members here, in arrival order, and releases the reconstructed
//! frame once the declared length is reached.
//!
//! Assemblies are keyed by direction as well as request id: our own
//! requests and the peer's requests share the numeric id space.
//!
//! When we close a stream whose response is still arriving, the peer
//! may already have queued the remaining members.  Such an assembly is
//! abandoned rather than removed: its bytes are released, the members
//! still in flight are counted and swallowed, and nothing is delivered.

use std::collections::HashMap;

use tracing::debug;

use super::frame::{Frame, MessageType};
use super::message::RequestId;
use crate::error::FrameError;

/// Key of an in-progress assembly: `(is_request, rid)`.
pub type AssemblyKey = (bool, RequestId);

pub fn assembly_key(frame: &Frame) -> AssemblyKey {
    (matches!(frame.message_type, MessageType::Request(_)), frame.rid)
}

/// Bytes collected so far for one logical payload.
#[derive(Debug)]
pub struct MultipartAssembly {
    primary: Frame,
    declared_total: usize,
    received: usize,
    frames: u32,
    abandoned: bool,
}

impl MultipartAssembly {
    fn new(primary: Frame, declared_total: usize) -> Self {
        Self {
            received: primary.body.len(),
            primary,
            declared_total,
            frames: 1,
            abandoned: false,
        }
    }

    pub fn received(&self) -> usize {
        self.received
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.declared_total
    }

    fn abandon(&mut self) {
        self.abandoned = true;
        self.primary.body = Vec::new();
    }
}

/// All assemblies in progress for one session.
#[derive(Debug, Default)]
pub struct Reassembler {
    assemblies: HashMap<AssemblyKey, MultipartAssembly>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one decoded frame.  Complete frames (multipart or not) are
    /// returned; members of an unfinished payload yield `None`.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Frame>, FrameError> {
        let key = assembly_key(&frame);
        if frame.headers.continuation {
            return self.continue_assembly(key, frame);
        }
        let Some(total) = frame.headers.total_len else {
            return Ok(Some(frame));
        };
        let total = total as usize;
        if self.assemblies.get(&key).is_some_and(|a| a.abandoned) {
            self.assemblies.remove(&key);
        }
        if self.assemblies.contains_key(&key) {
            return Err(FrameError::BadMultipart {
                rid: frame.rid,
                reason: "primary frame while an assembly is open",
            });
        }
        if frame.body.len() > total {
            return Err(FrameError::BadMultipart {
                rid: frame.rid,
                reason: "primary frame exceeds declared length",
            });
        }
        let assembly = MultipartAssembly::new(frame, total);
        if assembly.is_complete() {
            return Ok(Some(finish(assembly)));
        }
        self.assemblies.insert(key, assembly);
        Ok(None)
    }

    fn continue_assembly(&mut self, key: AssemblyKey, frame: Frame) -> Result<Option<Frame>, FrameError> {
        let Some(assembly) = self.assemblies.get_mut(&key) else {
            return Err(FrameError::BadMultipart {
                rid: frame.rid,
                reason: "continuation without a primary frame",
            });
        };
        if frame.headers.total_len.map(|t| t as usize) != Some(assembly.declared_total) {
            return Err(FrameError::BadMultipart {
                rid: frame.rid,
                reason: "declared length changed mid-assembly",
            });
        }
        if assembly.received() + frame.body.len() > assembly.declared_total {
            return Err(FrameError::BadMultipart {
                rid: frame.rid,
                reason: "payload overruns declared length",
            });
        }
        assembly.received += frame.body.len();
        if !assembly.abandoned {
            assembly.primary.body.extend_from_slice(&frame.body);
        }
        assembly.frames += 1;
        if !assembly.is_complete() {
            return Ok(None);
        }
        match self.assemblies.remove(&key) {
            Some(assembly) if assembly.abandoned => {
                debug!(rid = key.1, frames = assembly.frames, "abandoned multipart payload drained");
                Ok(None)
            }
            Some(assembly) => Ok(Some(finish(assembly))),
            None => Ok(None),
        }
    }

    /// Stop collecting a payload for a stream we closed.  Members that
    /// are still on the way are accepted and dropped.
    pub fn abandon(&mut self, key: AssemblyKey) {
        if let Some(assembly) = self.assemblies.get_mut(&key) {
            debug!(
                rid = key.1,
                received = assembly.received,
                declared = assembly.declared_total,
                "abandoning partial multipart payload"
            );
            assembly.abandon();
        }
    }

    /// Drop a partial payload whose stream closed before it finished.
    pub fn discard(&mut self, key: AssemblyKey) {
        if let Some(assembly) = self.assemblies.remove(&key) {
            debug!(
                rid = key.1,
                received = assembly.received,
                declared = assembly.declared_total,
                "discarding partial multipart payload"
            );
        }
    }

    pub fn in_progress(&self) -> usize {
        self.assemblies.len()
    }
}

fn finish(assembly: MultipartAssembly) -> Frame {
    let mut frame = assembly.primary;
    frame.headers.total_len = None;
    frame.headers.continuation = false;
    frame
}

/// Split `body` into frames of at most `max_body` bytes.  The first
/// frame keeps `template`'s headers; the rest are continuations.
pub fn split(template: Frame, body: Vec<u8>, max_body: usize) -> Vec<Frame> {
    if body.len() <= max_body {
        let mut frame = template;
        frame.body = body;
        return vec![frame];
    }
    let total = body.len() as u32;
    body.chunks(max_body)
        .enumerate()
        .map(|(i, chunk)| {
            let mut frame = if i == 0 {
                template.clone()
            } else {
                let mut next = Frame::new(template.message_type, template.rid);
                next.headers.continuation = true;
                next
            };
            frame.headers.total_len = Some(total);
            frame.body = chunk.to_vec();
            frame
        })
        .collect()
}
