//! Message envelopes and the in-process bus that carries them.
//!
//! Messages are encoded to bytes when sent and decoded on delivery, so every
//! message crossing the bus goes through the same codec a network transport
//! would use. Delivery is FIFO across the whole bus.

use std::collections::VecDeque;
use std::fmt;

use crate::messages::{self, RankMessage};
use crate::types::{ClientId, DaemonGid, MetaError, RankId};

/// Who sent a message.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Source {
    /// A rank, identified by the daemon that served it when sending.
    Rank {
        /// Sending rank
        rank: RankId,
        /// Daemon serving the sending rank
        gid: DaemonGid,
    },
    /// A client.
    Client(ClientId),
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Rank { rank, gid } => write!(f, "rank.{}({})", rank, gid),
            Source::Client(c) => write!(f, "{}", c),
        }
    }
}

/// A routed message.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    /// Sender
    pub from: Source,
    /// Destination rank
    pub to: RankId,
    /// Daemon the sender believes serves `to`; None means whichever does
    pub to_gid: Option<DaemonGid>,
    /// Payload
    pub message: RankMessage,
}

impl Envelope {
    /// The sending rank, if a rank sent it.
    pub fn from_rank(&self) -> Option<RankId> {
        match self.from {
            Source::Rank { rank, .. } => Some(rank),
            Source::Client(_) => None,
        }
    }

    /// The sending daemon, if a rank sent it.
    pub fn from_gid(&self) -> Option<DaemonGid> {
        match self.from {
            Source::Rank { gid, .. } => Some(gid),
            Source::Client(_) => None,
        }
    }
}

struct Frame {
    from: Source,
    to: RankId,
    to_gid: Option<DaemonGid>,
    bytes: Vec<u8>,
}

/// FIFO bus between the ranks of one cluster.
#[derive(Default)]
pub struct MessageBus {
    queue: VecDeque<Frame>,
    sent: u64,
    delivered: u64,
}

impl MessageBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Encodes and enqueues a message.
    pub fn send(&mut self, env: Envelope) -> Result<(), MetaError> {
        let bytes = messages::encode(&env.message)?;
        tracing::trace!(from = %env.from, to = %env.to, kind = env.message.kind(), "send");
        self.queue.push_back(Frame {
            from: env.from,
            to: env.to,
            to_gid: env.to_gid,
            bytes,
        });
        self.sent += 1;
        Ok(())
    }

    /// Enqueues a batch in order.
    pub fn send_all(&mut self, envs: Vec<Envelope>) -> Result<(), MetaError> {
        for env in envs {
            self.send(env)?;
        }
        Ok(())
    }

    /// Dequeues and decodes the next message.
    pub fn recv(&mut self) -> Result<Option<Envelope>, MetaError> {
        let Some(frame) = self.queue.pop_front() else {
            return Ok(None);
        };
        self.delivered += 1;
        Ok(Some(Envelope {
            from: frame.from,
            to: frame.to,
            to_gid: frame.to_gid,
            message: messages::decode(&frame.bytes)?,
        }))
    }

    /// Messages waiting.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True when nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Messages sent and delivered so far.
    pub fn counters(&self) -> (u64, u64) {
        (self.sent, self.delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DirId, OperationId};

    fn env(to: u32) -> Envelope {
        Envelope {
            from: Source::Rank {
                rank: RankId::new(0),
                gid: DaemonGid::new(1),
            },
            to: RankId::new(to),
            to_gid: Some(DaemonGid::new(2)),
            message: RankMessage::ExportCancel {
                op_id: OperationId::generate(),
                root: DirId::new(3),
            },
        }
    }

    #[test]
    fn test_fifo_delivery() {
        let mut bus = MessageBus::new();
        let a = env(1);
        let b = env(2);
        bus.send_all(vec![a.clone(), b.clone()]).unwrap();
        assert_eq!(bus.len(), 2);
        assert_eq!(bus.recv().unwrap(), Some(a));
        assert_eq!(bus.recv().unwrap(), Some(b));
        assert_eq!(bus.recv().unwrap(), None);
        assert_eq!(bus.counters(), (2, 2));
    }

    #[test]
    fn test_source_accessors() {
        let e = env(1);
        assert_eq!(e.from_rank(), Some(RankId::new(0)));
        assert_eq!(e.from_gid(), Some(DaemonGid::new(1)));
        let client = Envelope {
            from: Source::Client(ClientId::new(9)),
            ..e
        };
        assert_eq!(client.from_rank(), None);
        assert_eq!(client.from.to_string(), "client.9");
    }
}
