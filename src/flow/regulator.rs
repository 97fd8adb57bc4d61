//! Back-pressure between the overlay and the intercepted client.
//!
//! Overlay bytes may only be pushed toward the client while the client's
//! advertised window has room for them. Writers park on a `Notify` until the
//! window has room or an ACK advances the acknowledged number. Closing the
//! flow or the flow-control timeout also ends the wait.

use crate::config::FlowControlPolicy;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Result of asking for room to send `len` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The window has room.
    Send,
    /// Timed out, but the policy says send anyway.
    Proceed,
    /// Timed out and the policy says abort the flow.
    Drop,
    /// The flow closed while waiting.
    Closed,
}

#[derive(Debug, Default)]
struct WindowState {
    open: bool,
    closed: bool,
    scale: u8,
    /// Peer window in bytes, already scaled.
    peer_window: u32,
    peer_acked: u32,
    send_next: u32,
}

impl WindowState {
    fn outstanding(&self) -> u32 {
        self.send_next.wrapping_sub(self.peer_acked)
    }

    fn has_room(&self, len: usize) -> bool {
        if !self.open || self.peer_window == 0 {
            return false;
        }
        let outstanding = self.outstanding();
        // a window smaller than one chunk still admits it once the pipe is empty
        outstanding == 0 || u64::from(outstanding) + len as u64 <= u64::from(self.peer_window)
    }
}

pub struct TransferRegulator {
    window: Mutex<WindowState>,
    notify: Notify,
    timeout: Duration,
    policy: FlowControlPolicy,
}

impl TransferRegulator {
    pub fn new(timeout: Duration, policy: FlowControlPolicy) -> Self {
        Self {
            window: Mutex::new(WindowState::default()),
            notify: Notify::new(),
            timeout,
            policy,
        }
    }

    pub fn policy(&self) -> FlowControlPolicy {
        self.policy
    }

    /// Arms the regulator once the handshake completes. `send_next` is the
    /// first data sequence number, which the peer has already acknowledged.
    pub fn start(&self, send_next: u32, scale: u8, window: u16) {
        let mut state = self.window.lock();
        state.open = true;
        state.scale = scale.min(14);
        state.peer_window = u32::from(window) << state.scale;
        state.peer_acked = send_next;
        state.send_next = send_next;
        drop(state);
        self.notify.notify_waiters();
    }

    /// Folds in the window and, for ACK segments, the acknowledgment number
    /// of a segment from the peer.
    pub fn record_peer(&self, window: u16, ack: Option<u32>) {
        let mut state = self.window.lock();
        if !state.open {
            return;
        }
        state.peer_window = u32::from(window) << state.scale;
        if let Some(ack) = ack {
            let advance = ack.wrapping_sub(state.peer_acked);
            if advance <= state.outstanding() {
                state.peer_acked = ack;
            }
        }
        drop(state);
        self.notify.notify_waiters();
    }

    /// Moves the send edge after a segment carrying sequence space leaves.
    pub fn record_sent(&self, send_next: u32) {
        self.window.lock().send_next = send_next;
    }

    pub fn outstanding(&self) -> u32 {
        self.window.lock().outstanding()
    }

    pub fn is_closed(&self) -> bool {
        self.window.lock().closed
    }

    pub fn close(&self) {
        self.window.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Waits until the handshake completes. Returns false if the flow closes
    /// first.
    pub async fn wait_open(&self) -> bool {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.window.lock();
                if state.closed {
                    return false;
                }
                if state.open {
                    return true;
                }
            }
            notified.await;
        }
    }

    pub async fn wait_closed(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.window.lock().closed {
                return;
            }
            notified.await;
        }
    }

    /// Waits for room to send `len` bytes, at most the flow-control timeout.
    /// Any ACK that advances the acknowledged number while waiting admits the
    /// chunk even if the window still looks short.
    pub async fn acquire(&self, len: usize) -> Admission {
        let deadline = Instant::now() + self.timeout;
        let acked_at_start = self.window.lock().peer_acked;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(admission) = self.check(len, acked_at_start) {
                return admission;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.check(len, acked_at_start).unwrap_or(match self.policy {
                    FlowControlPolicy::Proceed => Admission::Proceed,
                    FlowControlPolicy::Drop => Admission::Drop,
                });
            }
        }
    }

    fn check(&self, len: usize, acked_at_start: u32) -> Option<Admission> {
        let state = self.window.lock();
        if state.closed {
            Some(Admission::Closed)
        } else if state.has_room(len) || (state.open && state.peer_acked != acked_at_start) {
            Some(Admission::Send)
        } else {
            None
        }
    }
}
