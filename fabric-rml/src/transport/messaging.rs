//! Tagged send/receive engine.

use super::pending::{Fire, OpBody, PendingOp};
use super::{Active, Transport};
use crate::error::{Result, RmlError};
use crate::fabric::FabricAddr;
use crate::protocol::{HEADER_SIZE, Header, MessageKind, fabric_tag, parse_uri};
use crate::types::{
    ChannelId, FailureKind, OpKey, OpState, OpStatus, PeerMatch, ProcessName, RecvCallback,
    SendCallback, Tag,
};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Where a send is addressed.
pub(crate) enum SendTarget {
    Peer(ProcessName),
    Channel(ChannelId),
}

impl Transport {
    /// Post a tagged send of the concatenated `regions` to `peer`.
    ///
    /// Returns once the send is posted or queued; `callback` fires exactly once
    /// from a later `progress()` with the outcome.
    pub fn send(
        &self,
        peer: ProcessName,
        regions: &[&[u8]],
        tag: Tag,
        callback: SendCallback,
    ) -> Result<OpKey> {
        self.submit_send(SendTarget::Peer(peer), regions, tag, callback)
    }

    pub fn send_buffer(
        &self,
        peer: ProcessName,
        buf: Vec<u8>,
        tag: Tag,
        callback: SendCallback,
    ) -> Result<OpKey> {
        self.send(peer, &[&buf], tag, callback)
    }

    pub(crate) fn submit_send(
        &self,
        target: SendTarget,
        regions: &[&[u8]],
        tag: Tag,
        callback: SendCallback,
    ) -> Result<OpKey> {
        self.with_active(|active| {
            let (peer, channel, timeout, limit) = match target {
                SendTarget::Peer(peer) => (peer, None, self.config.send_timeout, None),
                SendTarget::Channel(id) => {
                    let (peer, qos) = active.channels.route(id)?;
                    (
                        peer,
                        Some(id),
                        qos.timeout.unwrap_or(self.config.send_timeout),
                        qos.max_msg_size,
                    )
                }
            };
            let bytes: usize = regions.iter().map(|r| r.len()).sum();
            let max = limit.unwrap_or(active.res.info.max_msg_size.saturating_sub(HEADER_SIZE));
            if bytes > max {
                return Err(RmlError::MessageTooLarge { len: bytes, max });
            }
            if !self.config.defer_unresolved && active.resolver.contact(&peer).is_none() {
                return Err(RmlError::NoContact { peer });
            }

            let key = self.next_key();
            let frame = Header::data(self.me, channel).frame(regions);
            active.pending.insert(PendingOp::send(
                key, peer, tag, channel, bytes, timeout, false, callback,
            ))?;
            active.dispatch_send(key, peer, frame, fabric_tag(MessageKind::Data, tag));
            Ok(key)
        })
    }

    /// Post a receive for `tag` from `peer` (or from anyone).
    ///
    /// A persistent receive stays posted and invokes `callback` for every
    /// matching message until cancelled. At most one receive may be posted per
    /// (peer-or-any, tag).
    pub fn receive(
        &self,
        peer: PeerMatch,
        tag: Tag,
        persistent: bool,
        callback: RecvCallback,
    ) -> Result<OpKey> {
        self.with_active(|active| {
            if active.pending.contains_recv(peer, tag) {
                return Err(RmlError::DuplicateReceive { peer, tag });
            }
            let src = match peer {
                PeerMatch::Any => FabricAddr::UNSPEC,
                PeerMatch::Peer(p) => active.resolver.resolve(&p, active.res.av()?)?,
            };
            let key = self.next_key();
            let ftag = fabric_tag(MessageKind::Data, tag);
            let buf = active.pool.checkout();
            active.res.endpoint()?.trecv(buf, src, ftag, 0, key.0)?;
            active.pending.insert(PendingOp::recv(
                key,
                peer,
                tag,
                persistent,
                src,
                ftag,
                self.config.recv_timeout,
                callback,
            ))?;
            tracing::debug!(peer = %peer, tag, key = %key, persistent, "receive posted");
            Ok(key)
        })
    }

    /// Cancel the receive posted for (`peer`, `tag`).
    ///
    /// Its callback fires once with [`OpStatus::Cancelled`] before this returns,
    /// or right after the invocation in progress if the callback is currently
    /// running. No other completion is delivered for it afterwards.
    pub fn cancel_receive(&self, peer: PeerMatch, tag: Tag) -> Result<()> {
        let fires = {
            let mut guard = self.lock()?;
            let active = guard.as_mut().ok_or(RmlError::NotInitialized)?;
            let key = active
                .pending
                .recv_key(peer, tag)
                .ok_or(RmlError::ReceiveNotFound { peer, tag })?;
            let mut fires: Vec<Fire> = active
                .withdraw(key)
                .and_then(|op| op.finish(OpStatus::Cancelled))
                .into_iter()
                .collect();
            tracing::debug!(peer = %peer, tag, key = %key, "receive cancelled");
            self.park_orphans(&mut fires)?;
            fires
        };
        self.dispatch(fires);
        Ok(())
    }

    /// Send a header-only probe to the endpoint advertised in `uri`.
    ///
    /// The probe never creates a contact entry and never raises an exception.
    pub(crate) fn post_probe(
        &self,
        uri: &str,
        timeout: Duration,
        callback: SendCallback,
    ) -> Result<OpKey> {
        let (peer, name) = parse_uri(uri)?;
        self.with_active(|active| {
            let (addr, owned) = active.resolver.resolve_name(&peer, &name, active.res.av()?)?;
            let key = self.next_key();
            let frame = Header::probe(self.me).frame(&[]);
            let mut op = PendingOp::send(key, peer, 0, None, 0, timeout, true, callback);
            if owned {
                op.set_owned_addr(addr);
            }
            active.pending.insert(op)?;
            active.transmit(key, addr, frame, fabric_tag(MessageKind::Probe, 0), false);
            Ok(key)
        })
    }

    /// Drop a pending operation without invoking its callback.
    pub(crate) fn abandon(&self, key: OpKey) -> Result<()> {
        self.with_active(|active| {
            drop(active.withdraw(key));
            Ok(())
        })
    }

    /// Best-effort liveness probe of the process advertised in `uri`.
    ///
    /// Drives `progress()` on the calling thread until the probe completes or
    /// `timeout` expires. Returns `true` only if the fabric confirmed delivery.
    pub fn ping(&self, uri: &str, timeout: Duration) -> Result<bool> {
        let outcome = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&outcome);
        let key = self.post_probe(
            uri,
            timeout,
            Box::new(move |c| {
                if let Ok(mut s) = slot.lock() {
                    *s = Some(c.status.is_success());
                }
            }),
        )?;
        // `None` when the timeout is too large to represent: wait for the probe
        let deadline = Instant::now().checked_add(timeout);
        loop {
            self.progress()?;
            let done = *outcome
                .lock()
                .map_err(|_| RmlError::LockPoisoned("ping outcome"))?;
            if let Some(reachable) = done {
                return Ok(reachable);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                self.abandon(key)?;
                tracing::debug!(uri, "ping timed out");
                return Ok(false);
            }
            std::thread::sleep(self.config.ping_poll_interval);
        }
    }
}

impl Active {
    /// Resolve and post a framed send, or queue it until the peer's contact arrives.
    pub(crate) fn dispatch_send(&mut self, key: OpKey, peer: ProcessName, frame: Vec<u8>, ftag: u64) {
        let resolved = match self.res.av() {
            Ok(av) => self.resolver.resolve(&peer, av),
            Err(e) => Err(e),
        };
        match resolved {
            Ok(addr) => self.transmit(key, addr, frame, ftag, true),
            Err(RmlError::NoContact { .. }) => {
                if let Some(op) = self.pending.get_mut(key) {
                    op.set_deferred(frame, ftag);
                    self.deferred.push_back(key);
                    tracing::debug!(peer = %peer, key = %key, "send deferred until contact is known");
                }
            }
            Err(e) => self.complete_local(key, OpStatus::Failed(FailureKind::Post(e.to_string()))),
        }
    }

    /// Hand a framed message to the endpoint. Messages that fit the provider's
    /// inject size go inline (when `inline_ok`) and complete on the next progress.
    pub(crate) fn transmit(
        &mut self,
        key: OpKey,
        addr: FabricAddr,
        frame: Vec<u8>,
        ftag: u64,
        inline_ok: bool,
    ) {
        let inline = inline_ok && frame.len() <= self.res.info.inject_size;
        let posted = self.res.endpoint().and_then(|ep| {
            if inline {
                ep.tinject(frame, addr, ftag)
            } else {
                ep.tsend(frame, addr, ftag, key.0)
            }
        });
        match posted {
            Ok(()) if inline => self.complete_local(key, OpStatus::Success),
            Ok(()) => {}
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "send post failed");
                self.complete_local(key, OpStatus::Failed(FailureKind::Post(e.to_string())));
            }
        }
    }

    /// Settle an operation without a fabric completion; its callback fires on the next progress.
    pub(crate) fn complete_local(&mut self, key: OpKey, status: OpStatus) {
        if let Some(op) = self.pending.get_mut(key) {
            op.state = OpState::for_status(&status);
            self.local_done.push_back((key, status));
        }
    }

    /// Post every queued send for `peer`, in submission order.
    pub(crate) fn flush_deferred(&mut self, peer: &ProcessName) -> usize {
        let keys: Vec<OpKey> = self
            .deferred
            .iter()
            .copied()
            .filter(|k| self.pending.get(*k).is_some_and(|op| op.targets(peer)))
            .collect();
        self.deferred.retain(|k| !keys.contains(k));
        for &key in &keys {
            let Some((frame, ftag)) = self.pending.get_mut(key).and_then(|op| op.take_deferred())
            else {
                continue;
            };
            self.dispatch_send(key, *peer, frame, ftag);
        }
        if !keys.is_empty() {
            tracing::debug!(peer = %peer, flushed = keys.len(), "deferred sends posted");
        }
        keys.len()
    }

    /// Give back the address-vector entry a settled record owned, once no
    /// other record shares it.
    pub(crate) fn retire(&self, op: &PendingOp) {
        if let Some(addr) = op.owned_addr()
            && !self.pending.owns_addr(addr)
            && let Ok(av) = self.res.av()
        {
            self.resolver.release(addr, av);
        }
    }

    /// Remove a record, withdrawing whatever the fabric still holds for it.
    pub(crate) fn withdraw(&mut self, key: OpKey) -> Option<PendingOp> {
        let mut op = self.pending.remove(key)?;
        self.retire(&op);
        if matches!(op.body, OpBody::Send { .. }) {
            if op.take_deferred().is_some() {
                self.deferred.retain(|k| *k != key);
            }
        } else if let Ok(ep) = self.res.endpoint()
            && let Err(e) = ep.cancel(key.0)
        {
            // already matched; its completion will be discarded
            tracing::debug!(key = %key, error = %e, "cancel of posted receive failed");
        }
        Some(op)
    }
}
