//! Pending operation records and the set that correlates fabric completions back to them.

use super::channel::{ChannelCallback, ChannelEvent};
use crate::error::{Result, RmlError};
use crate::fabric::FabricAddr;
use crate::types::{
    ChannelId, Direction, OpKey, OpState, OpStatus, PeerMatch, ProcessName, RecvCallback,
    RecvCompletion, SendCallback, SendCompletion, Tag,
};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Direction-specific part of a pending record.
pub(crate) enum OpBody {
    Send {
        callback: Option<SendCallback>,
        /// Payload bytes, header excluded.
        bytes: usize,
        /// Framed message and fabric tag held until the peer's contact is known.
        deferred: Option<(Vec<u8>, u64)>,
        /// Liveness probes never escalate exceptions.
        probe: bool,
        /// Address-vector entry inserted for this send alone, removed when it settles.
        owned_addr: Option<FabricAddr>,
    },
    Recv {
        /// `None` while the callback is being invoked outside the lock.
        callback: Option<RecvCallback>,
        persistent: bool,
        src: FabricAddr,
        fabric_tag: u64,
        /// Completions that arrived while the callback was out.
        backlog: VecDeque<RecvCompletion>,
    },
    /// Internal persistent receive that absorbs liveness probes.
    ProbeSink { fabric_tag: u64, ignore: u64 },
}

pub(crate) struct PendingOp {
    pub(crate) key: OpKey,
    pub(crate) peer: PeerMatch,
    pub(crate) tag: Tag,
    pub(crate) channel: Option<ChannelId>,
    pub(crate) issued: Instant,
    pub(crate) timeout: Option<Duration>,
    pub(crate) state: OpState,
    pub(crate) body: OpBody,
}

impl PendingOp {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn send(
        key: OpKey,
        peer: ProcessName,
        tag: Tag,
        channel: Option<ChannelId>,
        bytes: usize,
        timeout: Duration,
        probe: bool,
        callback: SendCallback,
    ) -> Self {
        Self {
            key,
            peer: PeerMatch::Peer(peer),
            tag,
            channel,
            issued: Instant::now(),
            timeout: Some(timeout),
            state: OpState::Posted,
            body: OpBody::Send {
                callback: Some(callback),
                bytes,
                deferred: None,
                probe,
                owned_addr: None,
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn recv(
        key: OpKey,
        peer: PeerMatch,
        tag: Tag,
        persistent: bool,
        src: FabricAddr,
        fabric_tag: u64,
        timeout: Option<Duration>,
        callback: RecvCallback,
    ) -> Self {
        Self {
            key,
            peer,
            tag,
            channel: None,
            issued: Instant::now(),
            timeout: if persistent { None } else { timeout },
            state: OpState::Posted,
            body: OpBody::Recv {
                callback: Some(callback),
                persistent,
                src,
                fabric_tag,
                backlog: VecDeque::new(),
            },
        }
    }

    pub(crate) fn probe_sink(key: OpKey, fabric_tag: u64, ignore: u64) -> Self {
        Self {
            key,
            peer: PeerMatch::Any,
            tag: 0,
            channel: None,
            issued: Instant::now(),
            timeout: None,
            state: OpState::Posted,
            body: OpBody::ProbeSink { fabric_tag, ignore },
        }
    }

    pub(crate) fn direction(&self) -> Direction {
        match self.body {
            OpBody::Send { .. } => Direction::Send,
            OpBody::Recv { .. } | OpBody::ProbeSink { .. } => Direction::Recv,
        }
    }

    pub(crate) fn is_internal(&self) -> bool {
        matches!(self.body, OpBody::ProbeSink { .. })
    }

    pub(crate) fn is_probe(&self) -> bool {
        matches!(self.body, OpBody::Send { probe: true, .. })
    }

    pub(crate) fn is_persistent(&self) -> bool {
        matches!(
            self.body,
            OpBody::Recv {
                persistent: true,
                ..
            } | OpBody::ProbeSink { .. }
        )
    }

    pub(crate) fn expired(&self, now: Instant) -> bool {
        self.state == OpState::Posted
            && self
                .timeout
                .is_some_and(|t| now.saturating_duration_since(self.issued) >= t)
    }

    /// Whether this record is addressed to `peer` specifically.
    pub(crate) fn targets(&self, peer: &ProcessName) -> bool {
        self.peer == PeerMatch::Peer(*peer)
    }

    pub(crate) fn set_owned_addr(&mut self, addr: FabricAddr) {
        if let OpBody::Send { owned_addr, .. } = &mut self.body {
            *owned_addr = Some(addr);
        }
    }

    pub(crate) fn owned_addr(&self) -> Option<FabricAddr> {
        match self.body {
            OpBody::Send { owned_addr, .. } => owned_addr,
            _ => None,
        }
    }

    pub(crate) fn take_deferred(&mut self) -> Option<(Vec<u8>, u64)> {
        match &mut self.body {
            OpBody::Send { deferred, .. } => deferred.take(),
            _ => None,
        }
    }

    pub(crate) fn set_deferred(&mut self, frame: Vec<u8>, fabric_tag: u64) {
        if let OpBody::Send { deferred, .. } = &mut self.body {
            *deferred = Some((frame, fabric_tag));
        }
    }

    /// Take the receive callback to deliver `completion`, or queue it behind
    /// the invocation already in progress.
    pub(crate) fn claim_callback(
        &mut self,
        completion: RecvCompletion,
    ) -> Option<(RecvCallback, RecvCompletion)> {
        match &mut self.body {
            OpBody::Recv {
                callback, backlog, ..
            } => match callback.take() {
                Some(cb) => Some((cb, completion)),
                None => {
                    backlog.push_back(completion);
                    None
                }
            },
            _ => None,
        }
    }

    /// Hand the callback back after an invocation. Returns it with the next
    /// queued completion if one arrived meanwhile.
    pub(crate) fn restore_callback(
        &mut self,
        cb: RecvCallback,
    ) -> Option<(RecvCallback, RecvCompletion)> {
        match &mut self.body {
            OpBody::Recv {
                callback, backlog, ..
            } => match backlog.pop_front() {
                Some(next) => Some((cb, next)),
                None => {
                    *callback = Some(cb);
                    None
                }
            },
            _ => None,
        }
    }

    /// Consume the record, producing the callback invocation for its final status.
    pub(crate) fn finish(self, status: OpStatus) -> Option<Fire> {
        let key = self.key;
        match self.body {
            OpBody::Send {
                callback, bytes, ..
            } => {
                let peer = self.peer.peer()?;
                Some(Fire::Send {
                    callback: callback?,
                    completion: SendCompletion {
                        peer,
                        tag: self.tag,
                        channel: self.channel,
                        status,
                        bytes,
                    },
                })
            }
            OpBody::Recv { callback, .. } => {
                let completion = RecvCompletion {
                    sender: None,
                    posted_for: self.peer,
                    tag: self.tag,
                    channel: None,
                    status,
                    payload: Vec::new(),
                };
                Some(match callback {
                    Some(callback) => Fire::Recv {
                        key,
                        callback,
                        completion,
                        rearmed: false,
                    },
                    None => Fire::Orphan { key, completion },
                })
            }
            OpBody::ProbeSink { .. } => None,
        }
    }
}

/// A callback invocation collected under the lock and run after it is released.
pub(crate) enum Fire {
    Send {
        callback: SendCallback,
        completion: SendCompletion,
    },
    Recv {
        key: OpKey,
        callback: RecvCallback,
        completion: RecvCompletion,
        /// The record is still pending and gets its callback back afterwards.
        rearmed: bool,
    },
    /// Final completion for a receive whose callback is currently out;
    /// delivered right after that invocation returns.
    Orphan {
        key: OpKey,
        completion: RecvCompletion,
    },
    Channel {
        callback: ChannelCallback,
        channel: ChannelId,
        event: ChannelEvent,
    },
}

/// Outstanding operations, keyed by correlation key.
#[derive(Default)]
pub(crate) struct PendingSet {
    ops: HashMap<OpKey, PendingOp>,
    recv_index: HashMap<(PeerMatch, Tag), OpKey>,
}

impl PendingSet {
    /// Register a record. Only one receive may exist per (peer-or-any, tag).
    pub(crate) fn insert(&mut self, op: PendingOp) -> Result<()> {
        if let OpBody::Recv { .. } = op.body {
            let slot = (op.peer, op.tag);
            if self.recv_index.contains_key(&slot) {
                return Err(RmlError::DuplicateReceive {
                    peer: op.peer,
                    tag: op.tag,
                });
            }
            self.recv_index.insert(slot, op.key);
        }
        self.ops.insert(op.key, op);
        Ok(())
    }

    pub(crate) fn contains_recv(&self, peer: PeerMatch, tag: Tag) -> bool {
        self.recv_index.contains_key(&(peer, tag))
    }

    pub(crate) fn recv_key(&self, peer: PeerMatch, tag: Tag) -> Option<OpKey> {
        self.recv_index.get(&(peer, tag)).copied()
    }

    pub(crate) fn get(&self, key: OpKey) -> Option<&PendingOp> {
        self.ops.get(&key)
    }

    pub(crate) fn get_mut(&mut self, key: OpKey) -> Option<&mut PendingOp> {
        self.ops.get_mut(&key)
    }

    pub(crate) fn remove(&mut self, key: OpKey) -> Option<PendingOp> {
        let op = self.ops.remove(&key)?;
        if let OpBody::Recv { .. } = op.body {
            self.recv_index.remove(&(op.peer, op.tag));
        }
        Some(op)
    }

    /// Keys of records whose deadline has passed, oldest first.
    pub(crate) fn expired(&self, now: Instant) -> Vec<OpKey> {
        let mut keys: Vec<OpKey> = self
            .ops
            .values()
            .filter(|op| op.expired(now))
            .map(|op| op.key)
            .collect();
        keys.sort_unstable();
        keys
    }

    /// Keys of unfinished records addressed to `peer`, oldest first.
    pub(crate) fn targeting(&self, peer: &ProcessName) -> Vec<OpKey> {
        let mut keys: Vec<OpKey> = self
            .ops
            .values()
            .filter(|op| op.targets(peer) && !op.state.is_terminal())
            .map(|op| op.key)
            .collect();
        keys.sort_unstable();
        keys
    }

    /// Whether any record still owns the address-vector entry `addr`.
    pub(crate) fn owns_addr(&self, addr: FabricAddr) -> bool {
        self.ops.values().any(|op| op.owned_addr() == Some(addr))
    }

    /// Whether a send posted before `op` to the same (peer, tag) is still in flight.
    pub(crate) fn has_earlier_send(&self, op: &PendingOp) -> bool {
        !op.is_probe()
            && self.ops.values().any(|o| {
                o.key < op.key
                    && o.direction() == Direction::Send
                    && !o.is_probe()
                    && o.peer == op.peer
                    && o.tag == op.tag
                    && o.state == OpState::Posted
            })
    }

    /// Remove every record, oldest first.
    pub(crate) fn drain(&mut self) -> Vec<PendingOp> {
        self.recv_index.clear();
        let mut ops: Vec<PendingOp> = self.ops.drain().map(|(_, op)| op).collect();
        ops.sort_unstable_by_key(|op| op.key);
        ops
    }

    /// Number of caller-visible records.
    pub(crate) fn len(&self) -> usize {
        self.ops.values().filter(|op| !op.is_internal()).count()
    }
}
