//! Per-connection acknowledgment tracking for reliable server messages.

use crate::error::Result;
use crate::protocol::ServerMessage;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Retransmission policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// How long to wait for an ack before resending.
    pub ack_timeout: Duration,
    /// Resends after which the connection is abandoned.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            ack_timeout: Duration::from_secs(5),
            max_retries: 5,
        }
    }
}

#[derive(Debug)]
struct Unacked {
    frame: String,
    sent_at: Instant,
    retries: u32,
}

/// What to do after checking the outbox for overdue messages.
#[derive(Debug, PartialEq, Eq)]
pub enum Retransmit {
    /// Frames to send again, oldest first.
    Resend(Vec<String>),
    /// A message exhausted its retries; give up on the connection.
    Abandon { msg_id: u64 },
}

/// Assigns `msg_id`s and holds every reliable frame until it is acked.
#[derive(Debug)]
pub struct Outbox {
    policy: RetryPolicy,
    next_id: u64,
    unacked: BTreeMap<u64, Unacked>,
}

impl Outbox {
    pub fn new(policy: RetryPolicy) -> Self {
        Outbox {
            policy,
            next_id: 1,
            unacked: BTreeMap::new(),
        }
    }

    /// Encode a message for sending, stamping and tracking it if reliable.
    pub fn prepare(&mut self, mut message: ServerMessage, now: Instant) -> Result<String> {
        if !message.is_reliable() {
            return message.encode();
        }

        let msg_id = self.next_id;
        self.next_id += 1;
        message.set_msg_id(msg_id);

        let frame = message.encode()?;
        self.unacked.insert(
            msg_id,
            Unacked {
                frame: frame.clone(),
                sent_at: now,
                retries: 0,
            },
        );
        Ok(frame)
    }

    /// Returns false for unknown or already acknowledged ids.
    pub fn ack(&mut self, msg_id: u64) -> bool {
        self.unacked.remove(&msg_id).is_some()
    }

    pub fn pending(&self) -> usize {
        self.unacked.len()
    }

    /// Collect frames whose ack is overdue and mark them as resent.
    pub fn due(&mut self, now: Instant) -> Retransmit {
        let mut frames = Vec::new();
        for (msg_id, unacked) in self.unacked.iter_mut() {
            if now.duration_since(unacked.sent_at) < self.policy.ack_timeout {
                continue;
            }
            if unacked.retries >= self.policy.max_retries {
                return Retransmit::Abandon { msg_id: *msg_id };
            }
            unacked.retries += 1;
            unacked.sent_at = now;
            frames.push(unacked.frame.clone());
        }
        Retransmit::Resend(frames)
    }
}
