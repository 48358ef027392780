//! Completion and progress engine.
//!
//! `progress()` collects work under the state lock (local completions,
//! channel transitions, a bounded batch of completion-queue entries, and the
//! periodic timeout sweep), then releases the lock before invoking any
//! callback or exception handler.

use super::exception::ExceptionKind;
use super::pending::{Fire, OpBody};
use super::{Active, Transport};
use crate::error::{Result, RmlError};
use crate::fabric::{CqErrorKind, CqEvent, FabricAddr};
use crate::protocol::{HEADER_SIZE, Header, MessageKind};
use crate::types::{
    Direction, FailureKind, OpKey, OpStatus, ProcessName, RecvCallback, RecvCompletion,
};
use std::collections::BTreeSet;
use std::time::Instant;

/// Work collected under the lock.
#[derive(Default)]
pub(crate) struct Outcome {
    pub(crate) fires: Vec<Fire>,
    escalations: Vec<(ProcessName, ExceptionKind)>,
}

impl Outcome {
    fn escalate(&mut self, peer: ProcessName, kind: ExceptionKind) {
        if !self.escalations.contains(&(peer, kind)) {
            self.escalations.push((peer, kind));
        }
    }
}

fn status_for(kind: &CqErrorKind, op: Direction) -> OpStatus {
    match kind {
        CqErrorKind::Truncated { len } => {
            let len = match op {
                Direction::Recv => len.saturating_sub(HEADER_SIZE),
                Direction::Send => *len,
            };
            OpStatus::Failed(FailureKind::Truncated { len })
        }
        CqErrorKind::Cancelled => OpStatus::Cancelled,
        CqErrorKind::Unreachable => OpStatus::Failed(FailureKind::Unreachable),
        CqErrorKind::ConnectionLost => OpStatus::Failed(FailureKind::ConnectionLost),
        CqErrorKind::Other(code) => OpStatus::Failed(FailureKind::Fabric(*code)),
    }
}

fn exception_for(status: &OpStatus) -> Option<ExceptionKind> {
    match status {
        OpStatus::Failed(FailureKind::Unreachable) => Some(ExceptionKind::Unreachable),
        OpStatus::Failed(FailureKind::ConnectionLost) => Some(ExceptionKind::ConnectionLost),
        _ => None,
    }
}

impl Transport {
    /// Drive the transport once without blocking.
    ///
    /// Returns the number of callbacks invoked.
    pub fn progress(&self) -> Result<usize> {
        let mut out = Outcome::default();
        {
            let mut guard = self.lock()?;
            let active = guard.as_mut().ok_or(RmlError::NotInitialized)?;
            active.drain_channel_events(&mut out);
            active.poll_cq(self.config.cq_batch, &mut out);
            let now = Instant::now();
            if now.saturating_duration_since(active.last_sweep) >= self.config.sweep_interval {
                active.last_sweep = now;
                active.sweep(now, self.config.escalate_timeouts, &mut out);
            }
            active.drain_local(&mut out);
            self.park_orphans(&mut out.fires)?;
        }
        let count = out.fires.len();
        self.dispatch(out.fires);
        for (peer, kind) in out.escalations {
            self.notify_exception(peer, kind)?;
        }
        Ok(count)
    }

    /// Move final completions for callbacks that are currently out into the
    /// orphan table. Must be called with the state lock held.
    pub(crate) fn park_orphans(&self, fires: &mut Vec<Fire>) -> Result<()> {
        if !fires.iter().any(|f| matches!(f, Fire::Orphan { .. })) {
            return Ok(());
        }
        let mut orphans = self
            .orphans
            .lock()
            .map_err(|_| RmlError::LockPoisoned("orphans"))?;
        for fire in std::mem::take(fires) {
            match fire {
                Fire::Orphan { key, completion } => {
                    orphans.insert(key, completion);
                }
                other => fires.push(other),
            }
        }
        Ok(())
    }

    /// Invoke collected callbacks. Must be called without the state lock.
    pub(crate) fn dispatch(&self, fires: Vec<Fire>) {
        for fire in fires {
            match fire {
                Fire::Send {
                    callback,
                    completion,
                } => callback(completion),
                Fire::Recv {
                    key,
                    callback,
                    completion,
                    rearmed: true,
                } => self.run_persistent(key, callback, completion),
                Fire::Recv {
                    mut callback,
                    completion,
                    ..
                } => callback(completion),
                Fire::Channel {
                    callback,
                    channel,
                    event,
                } => callback(channel, event),
                Fire::Orphan { key, .. } => {
                    tracing::debug!(key = %key, "orphan completion reached dispatch");
                }
            }
        }
    }

    /// Deliver to a persistent receive, then hand its callback back to the
    /// record, draining completions that queued up meanwhile. If the record
    /// went away during the invocation, its final completion is delivered now.
    fn run_persistent(&self, key: OpKey, mut callback: RecvCallback, mut completion: RecvCompletion) {
        loop {
            callback(completion);
            let Ok(mut guard) = self.state.lock() else {
                return;
            };
            let next = match guard.as_mut().and_then(|a| a.pending.get_mut(key)) {
                Some(op) => match op.restore_callback(callback) {
                    Some(next) => next,
                    None => return,
                },
                None => {
                    let orphan = self.orphans.lock().ok().and_then(|mut o| o.remove(&key));
                    drop(guard);
                    if let Some(last) = orphan {
                        callback(last);
                    }
                    return;
                }
            };
            drop(guard);
            (callback, completion) = next;
        }
    }
}

impl Active {
    /// Release settled sends in post order. A send stays queued while an
    /// earlier send to the same (peer, tag) is still in flight.
    pub(crate) fn drain_local(&mut self, out: &mut Outcome) {
        if self.local_done.is_empty() {
            return;
        }
        let mut settled: Vec<(OpKey, OpStatus)> = self.local_done.drain(..).collect();
        settled.sort_by_key(|(key, _)| *key);
        for (key, status) in settled {
            let held = self
                .pending
                .get(key)
                .is_some_and(|op| self.pending.has_earlier_send(op));
            if held {
                self.local_done.push_back((key, status));
            } else if let Some(op) = self.pending.remove(key) {
                self.retire(&op);
                out.fires.extend(op.finish(status));
            }
        }
    }

    pub(crate) fn drain_channel_events(&mut self, out: &mut Outcome) {
        for (channel, event, callback) in self.channels.take_events() {
            out.fires.push(Fire::Channel {
                callback,
                channel,
                event,
            });
        }
    }

    fn poll_cq(&mut self, batch: usize, out: &mut Outcome) {
        let mut events = Vec::with_capacity(batch);
        let read = self.res.cq().and_then(|cq| cq.read(batch, &mut events));
        if let Err(e) = read {
            tracing::error!(error = %e, "completion queue read failed");
        }
        for event in events {
            self.on_event(event, out);
        }
    }

    fn on_event(&mut self, event: CqEvent, out: &mut Outcome) {
        let key = OpKey(event.context());
        let Some(direction) = self.pending.get(key).map(|op| op.direction()) else {
            tracing::debug!(key = %key, "completion for retired operation");
            self.recycle(event);
            return;
        };
        match direction {
            Direction::Send => self.on_send_event(key, event, out),
            Direction::Recv => self.on_recv_event(key, event, out),
        }
    }

    fn recycle(&self, event: CqEvent) {
        let buf = match event {
            CqEvent::Done(e) => e.buf,
            CqEvent::Error(e) => e.buf,
        };
        if let Some(buf) = buf {
            self.pool.checkin(buf);
        }
    }

    fn on_send_event(&mut self, key: OpKey, event: CqEvent, out: &mut Outcome) {
        let Some(op) = self.pending.get(key) else {
            return;
        };
        if op.state.is_terminal() {
            tracing::debug!(key = %key, "completion for send already settled");
            return;
        }
        let status = match &event {
            CqEvent::Done(_) => OpStatus::Success,
            CqEvent::Error(err) => {
                tracing::warn!(key = %key, peer = %op.peer, tag = op.tag, kind = ?err.kind, "send failed");
                status_for(&err.kind, Direction::Send)
            }
        };
        if !op.is_probe()
            && let Some(peer) = op.peer.peer()
            && let Some(kind) = exception_for(&status)
        {
            out.escalate(peer, kind);
        }
        self.complete_local(key, status);
    }

    fn on_recv_event(&mut self, key: OpKey, event: CqEvent, out: &mut Outcome) {
        let Some(op) = self.pending.get(key) else {
            return;
        };
        let (posted_for, tag, persistent) = (op.peer, op.tag, op.is_persistent());

        if matches!(op.body, OpBody::ProbeSink { .. }) {
            let cancelled = matches!(
                &event,
                CqEvent::Error(e) if e.kind == CqErrorKind::Cancelled
            );
            self.recycle(event);
            if cancelled {
                self.pending.remove(key);
            } else if let Err(e) = self.rearm(key) {
                tracing::warn!(error = %e, "probe sink re-arm failed");
                self.pending.remove(key);
            }
            return;
        }

        let completion = match event {
            CqEvent::Done(entry) => {
                let mut buf = entry.buf.unwrap_or_default();
                buf.truncate(entry.len);
                match Header::decode(&buf) {
                    Some(h) if h.kind == MessageKind::Data => {
                        buf.drain(..HEADER_SIZE);
                        RecvCompletion {
                            sender: Some(h.src),
                            posted_for,
                            tag,
                            channel: h.channel,
                            status: OpStatus::Success,
                            payload: buf,
                        }
                    }
                    _ => {
                        tracing::warn!(key = %key, tag, len = buf.len(), "malformed message header");
                        self.pool.checkin(buf);
                        RecvCompletion {
                            sender: None,
                            posted_for,
                            tag,
                            channel: None,
                            status: OpStatus::Failed(FailureKind::Malformed),
                            payload: Vec::new(),
                        }
                    }
                }
            }
            CqEvent::Error(err) => {
                tracing::warn!(key = %key, tag, kind = ?err.kind, "receive failed");
                if let Some(buf) = err.buf {
                    self.pool.checkin(buf);
                }
                RecvCompletion {
                    sender: None,
                    posted_for,
                    tag,
                    channel: None,
                    status: status_for(&err.kind, Direction::Recv),
                    payload: Vec::new(),
                }
            }
        };

        if !persistent || completion.status == OpStatus::Cancelled {
            if let Some(op) = self.pending.remove(key) {
                match op.body {
                    OpBody::Recv {
                        callback: Some(callback),
                        ..
                    } => out.fires.push(Fire::Recv {
                        key,
                        callback,
                        completion,
                        rearmed: false,
                    }),
                    _ => out.fires.push(Fire::Orphan { key, completion }),
                }
            }
            return;
        }

        let rearmed = self.rearm(key);
        if let Some(op) = self.pending.get_mut(key)
            && let Some((callback, completion)) = op.claim_callback(completion)
        {
            out.fires.push(Fire::Recv {
                key,
                callback,
                completion,
                rearmed: true,
            });
        }
        if let Err(e) = rearmed {
            tracing::warn!(key = %key, tag, error = %e, "persistent receive re-arm failed");
            if let Some(op) = self.pending.remove(key) {
                out.fires
                    .extend(op.finish(OpStatus::Failed(FailureKind::Post(e.to_string()))));
            }
        }
    }

    /// Post a fresh buffer for a persistent record under its existing key.
    pub(crate) fn rearm(&mut self, key: OpKey) -> Result<()> {
        let (src, ftag, ignore) = match self.pending.get(key).map(|op| &op.body) {
            Some(OpBody::Recv {
                src, fabric_tag, ..
            }) => (*src, *fabric_tag, 0),
            Some(OpBody::ProbeSink { fabric_tag, ignore }) => {
                (FabricAddr::UNSPEC, *fabric_tag, *ignore)
            }
            _ => return Ok(()),
        };
        let buf = self.pool.checkout();
        self.res.endpoint()?.trecv(buf, src, ftag, ignore, key.0)
    }

    /// Fail every operation past its deadline and collect peers to escalate,
    /// at most once per peer per sweep.
    fn sweep(&mut self, now: Instant, escalate: bool, out: &mut Outcome) {
        let mut unreachable = BTreeSet::new();
        for key in self.pending.expired(now) {
            let Some(op) = self.pending.get_mut(key) else {
                continue;
            };
            tracing::warn!(
                key = %key,
                peer = %op.peer,
                tag = op.tag,
                direction = ?op.direction(),
                "operation timed out"
            );
            if op.direction() == Direction::Recv {
                if let Some(op) = self.withdraw(key) {
                    out.fires.extend(op.finish(OpStatus::TimedOut));
                }
                continue;
            }
            if escalate
                && !op.is_probe()
                && let Some(peer) = op.peer.peer()
            {
                unreachable.insert(peer);
            }
            // sends settle in post order through the local queue
            if op.take_deferred().is_some() {
                self.deferred.retain(|k| *k != key);
            }
            self.complete_local(key, OpStatus::TimedOut);
        }
        for peer in unreachable {
            out.escalate(peer, ExceptionKind::Unreachable);
        }
    }
}
