//! Sequence numbers, acknowledgements and credit for v2.
//!
//! Each direction of a v2 session numbers its credit-consuming frames
//! 1, 2, 3, ...  Every outgoing frame carries the highest sequence we
//! have received in order, and the peer may run at most `window` frames
//! ahead of the last ack it has seen from us.  The same holds for us:
//! before a frame is written the writer takes a sequence number with
//! [`AckWindow::next_ack`], which fails while the window is exhausted.
//!
//! The window does no I/O.  The session writer consults it before each
//! frame and waits on [`AckWindow::credit_granted`] or
//! [`AckWindow::ack_due`] when it cannot proceed.  Waiting on both
//! prevents two peers that have exhausted each other's credit from
//! stalling: explicit ack frames never consume credit.

use std::sync::Mutex;

use tokio::sync::Notify;
use tracing::{trace, warn};

use crate::config::WindowViolationPolicy;
use crate::error::FrameError;

#[derive(Debug, Default)]
struct AckState {
    /// Sequence of the next frame we send.
    next_seq: u32,
    /// Highest sequence the peer has acknowledged.
    peer_ack: u32,
    /// Highest sequence received in order from the peer.
    received: u32,
    /// Last ack value we put on the wire.
    last_ack_sent: u32,
}

/// Credit and acknowledgement bookkeeping for one v2 session.
#[derive(Debug)]
pub struct AckWindow {
    window: u32,
    policy: WindowViolationPolicy,
    state: Mutex<AckState>,
    credit: Notify,
    ack_due: Notify,
}

impl AckWindow {
    pub fn new(window: u32, policy: WindowViolationPolicy) -> Self {
        Self {
            window: window.max(1),
            policy,
            state: Mutex::new(AckState {
                next_seq: 1,
                ..AckState::default()
            }),
            credit: Notify::new(),
            ack_due: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AckState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Take the sequence number for the next outgoing frame, or `None`
    /// if doing so would run past the peer's last ack plus the window.
    pub fn next_ack(&self) -> Option<u32> {
        let mut state = self.lock();
        let seq = state.next_seq;
        if seq > state.peer_ack.saturating_add(self.window) {
            return None;
        }
        state.next_seq += 1;
        Some(seq)
    }

    /// Wait until a sequence number can be taken.
    pub async fn acquire(&self) -> u32 {
        loop {
            let notified = self.credit.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(seq) = self.next_ack() {
                return seq;
            }
            notified.await;
        }
    }

    /// Resolves after the peer's ack has advanced.  The caller should
    /// retry [`AckWindow::next_ack`].
    pub async fn credit_granted(&self) {
        self.credit.notified().await;
    }

    /// Resolves once enough frames have arrived that an explicit ack
    /// is worth sending.
    pub async fn ack_due(&self) {
        self.ack_due.notified().await;
    }

    /// Record the ack field of an inbound frame.
    pub fn on_peer_ack(&self, ack: u32) -> Result<(), FrameError> {
        let mut state = self.lock();
        if ack < state.peer_ack {
            return Err(FrameError::AckViolation(format!(
                "ack went backwards from {} to {ack}",
                state.peer_ack
            )));
        }
        let last_sent = state.next_seq - 1;
        if ack > last_sent {
            return Err(FrameError::AckViolation(format!(
                "ack {ack} is beyond the last frame sent ({last_sent})"
            )));
        }
        if ack > state.peer_ack {
            trace!(ack, "peer ack advanced");
            state.peer_ack = ack;
            drop(state);
            self.credit.notify_one();
        }
        Ok(())
    }

    /// Record the sequence number of an inbound frame that consumes
    /// credit.  Frames must arrive without gaps.
    pub fn on_received(&self, seq: u32) -> Result<(), FrameError> {
        let mut state = self.lock();
        let expected = state.received + 1;
        if seq != expected {
            return Err(FrameError::SequenceGap { expected, got: seq });
        }
        let allowed = state.last_ack_sent.saturating_add(self.window);
        if seq > allowed {
            match self.policy {
                WindowViolationPolicy::Disconnect => {
                    return Err(FrameError::WindowViolation { seq, allowed });
                }
                WindowViolationPolicy::Ignore => {
                    warn!(seq, allowed, "peer exceeded the ack window");
                }
            }
        }
        state.received = seq;
        let unacked = state.received - state.last_ack_sent;
        drop(state);
        if unacked >= (self.window / 2).max(1) {
            self.ack_due.notify_one();
        }
        Ok(())
    }

    /// Highest sequence safely received, to piggyback on the next frame.
    pub fn ack_to_send(&self) -> u32 {
        self.lock().received
    }

    /// Note that `ack` went out on the wire.
    pub fn mark_ack_sent(&self, ack: u32) {
        let mut state = self.lock();
        if ack > state.last_ack_sent {
            state.last_ack_sent = ack;
        }
    }

    /// Whether frames have arrived since the last ack we sent.
    pub fn ack_pending(&self) -> bool {
        let state = self.lock();
        state.received > state.last_ack_sent
    }

    /// Frames sent but not yet acknowledged.
    pub fn in_flight(&self) -> u32 {
        let state = self.lock();
        state.next_seq - 1 - state.peer_ack
    }

    pub fn window(&self) -> u32 {
        self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn sequences_stop_at_the_window() {
        let win = AckWindow::new(3, WindowViolationPolicy::Disconnect);
        assert_eq!(win.next_ack(), Some(1));
        assert_eq!(win.next_ack(), Some(2));
        assert_eq!(win.next_ack(), Some(3));
        assert_eq!(win.next_ack(), None);
        assert_eq!(win.in_flight(), 3);

        win.on_peer_ack(2).unwrap();
        assert_eq!(win.next_ack(), Some(4));
        assert_eq!(win.next_ack(), Some(5));
        assert_eq!(win.next_ack(), None);
    }

    #[test]
    fn never_exceeds_ack_plus_window() {
        // Acks arrive in arbitrary (but monotonic) steps; no sequence
        // handed out may pass the last ack plus the window.
        let window = 5;
        let win = AckWindow::new(window, WindowViolationPolicy::Disconnect);
        let mut acked = 0u32;
        let mut highest = 0u32;
        for step in [0u32, 1, 3, 0, 2, 5, 1, 4, 0, 3] {
            while let Some(seq) = win.next_ack() {
                assert_eq!(seq, highest + 1);
                highest = seq;
                assert!(seq <= acked + window);
            }
            acked = (acked + step).min(highest);
            win.on_peer_ack(acked).unwrap();
        }
        assert!(highest > window);
    }

    #[test]
    fn ack_must_be_monotonic_and_in_range() {
        let win = AckWindow::new(8, WindowViolationPolicy::Disconnect);
        for _ in 0..4 {
            win.next_ack().unwrap();
        }
        win.on_peer_ack(3).unwrap();
        win.on_peer_ack(3).unwrap();
        assert!(win.on_peer_ack(2).unwrap_err().is_fatal());
        assert!(matches!(win.on_peer_ack(9), Err(FrameError::AckViolation(_))));
    }

    #[test]
    fn gaps_are_fatal() {
        let win = AckWindow::new(8, WindowViolationPolicy::Disconnect);
        win.on_received(1).unwrap();
        let err = win.on_received(3).unwrap_err();
        assert!(matches!(err, FrameError::SequenceGap { expected: 2, got: 3 }));
    }

    #[test]
    fn window_violation_follows_policy() {
        let strict = AckWindow::new(2, WindowViolationPolicy::Disconnect);
        strict.on_received(1).unwrap();
        strict.on_received(2).unwrap();
        assert!(matches!(
            strict.on_received(3),
            Err(FrameError::WindowViolation { seq: 3, allowed: 2 })
        ));

        let lax = AckWindow::new(2, WindowViolationPolicy::Ignore);
        for seq in 1..=4 {
            lax.on_received(seq).unwrap();
        }
        assert_eq!(lax.ack_to_send(), 4);
    }

    #[test]
    fn acks_sent_extend_the_peer_window() {
        let win = AckWindow::new(2, WindowViolationPolicy::Disconnect);
        win.on_received(1).unwrap();
        win.on_received(2).unwrap();
        assert!(win.ack_pending());
        win.mark_ack_sent(win.ack_to_send());
        assert!(!win.ack_pending());
        win.on_received(3).unwrap();
        win.on_received(4).unwrap();
    }

    #[tokio::test]
    async fn acquire_waits_for_credit() {
        let win = Arc::new(AckWindow::new(1, WindowViolationPolicy::Disconnect));
        assert_eq!(win.acquire().await, 1);

        let waiter = win.clone();
        let task = tokio::spawn(async move { waiter.acquire().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());

        win.on_peer_ack(1).unwrap();
        let seq = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seq, 2);
    }
}
