// Pending timers for the connection manager.
//
// The manager never sleeps. It records deadlines here, the driver
// (`ConnectionManager::pump`) bounds its blocking receive by
// `next_deadline()`, and `take_expired()` hands back whatever is due, oldest
// deadline first. Tests pass explicit `Instant`s instead of waiting.
//
// Timers that belong to a peer object carry its generation so that a retry or
// relay restart can cancel exactly the timers of the peer being destroyed.

use std::time::Instant;

use parlor_protocol::ConnId;

use crate::backend::PeerGeneration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerKind {
    /// The peer for `generation` has not opened on the signaling service.
    AttemptTimeout { generation: PeerGeneration },
    /// Backoff elapsed; start the next connect attempt.
    RetryConnect,
    /// The client's channel to the host has not opened.
    ChannelOpenTimeout {
        generation: PeerGeneration,
        conn: ConnId,
    },
}

impl TimerKind {
    fn generation(&self) -> Option<PeerGeneration> {
        match self {
            TimerKind::AttemptTimeout { generation }
            | TimerKind::ChannelOpenTimeout { generation, .. } => Some(*generation),
            TimerKind::RetryConnect => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct Timers {
    pending: Vec<(Instant, TimerKind)>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, at: Instant, kind: TimerKind) {
        self.pending.push((at, kind));
    }

    /// Cancel every timer equal to `kind`.
    pub fn cancel(&mut self, kind: TimerKind) {
        self.pending.retain(|(_, k)| *k != kind);
    }

    /// Cancel every timer tied to the peer object `generation`.
    pub fn cancel_generation(&mut self, generation: PeerGeneration) {
        self.pending
            .retain(|(_, k)| k.generation() != Some(generation));
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.iter().map(|(at, _)| *at).min()
    }

    /// Remove and return every timer due at `now`, earliest first.
    pub fn take_expired(&mut self, now: Instant) -> Vec<TimerKind> {
        let mut due: Vec<(Instant, TimerKind)> = Vec::new();
        self.pending.retain(|entry| {
            if entry.0 <= now {
                due.push(*entry);
                false
            } else {
                true
            }
        });
        due.sort_by_key(|(at, _)| *at);
        due.into_iter().map(|(_, kind)| kind).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
