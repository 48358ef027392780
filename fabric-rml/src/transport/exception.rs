//! Peer-failure notification and purge.

use super::Transport;
use super::pending::Fire;
use crate::error::{Result, RmlError};
use crate::types::{OpKey, OpStatus, ProcessName};
use std::collections::HashMap;
use std::sync::Arc;

/// Kind of failure reported for a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionKind {
    /// The fabric could not reach the peer, or operations to it timed out.
    Unreachable,
    /// An established association with the peer was lost.
    ConnectionLost,
}

impl std::fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExceptionKind::Unreachable => f.write_str("unreachable"),
            ExceptionKind::ConnectionLost => f.write_str("connection lost"),
        }
    }
}

/// Observer of peer failures.
pub trait ExceptionHandler: Send + Sync {
    fn on_exception(&self, peer: &ProcessName, kind: ExceptionKind);
}

impl<F> ExceptionHandler for F
where
    F: Fn(&ProcessName, ExceptionKind) + Send + Sync,
{
    fn on_exception(&self, peer: &ProcessName, kind: ExceptionKind) {
        self(peer, kind)
    }
}

/// Registered handlers in registration order. Identity is the `Arc` allocation.
#[derive(Default)]
pub(crate) struct ExceptionRegistry {
    handlers: Vec<Arc<dyn ExceptionHandler>>,
}

fn same(a: &Arc<dyn ExceptionHandler>, b: &Arc<dyn ExceptionHandler>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl ExceptionRegistry {
    pub(crate) fn from_handlers(handlers: Vec<Arc<dyn ExceptionHandler>>) -> Self {
        Self { handlers }
    }

    pub(crate) fn add(&mut self, handler: Arc<dyn ExceptionHandler>) -> Result<()> {
        if self.handlers.iter().any(|h| same(h, &handler)) {
            return Err(RmlError::DuplicateException);
        }
        self.handlers.push(handler);
        Ok(())
    }

    pub(crate) fn remove(&mut self, handler: &Arc<dyn ExceptionHandler>) -> Result<()> {
        let idx = self
            .handlers
            .iter()
            .position(|h| same(h, handler))
            .ok_or(RmlError::ExceptionNotRegistered)?;
        self.handlers.remove(idx);
        Ok(())
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<dyn ExceptionHandler>> {
        self.handlers.clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.handlers.len()
    }

    pub(crate) fn into_handlers(self) -> Vec<Arc<dyn ExceptionHandler>> {
        self.handlers
    }
}

impl Transport {
    /// Register a failure observer. Registering the same handler twice is rejected.
    pub fn add_exception(&self, handler: Arc<dyn ExceptionHandler>) -> Result<()> {
        self.with_active(|active| active.exceptions.add(handler))
    }

    pub fn remove_exception(&self, handler: &Arc<dyn ExceptionHandler>) -> Result<()> {
        self.with_active(|active| active.exceptions.remove(handler))
    }

    pub fn exception_handlers(&self) -> Result<usize> {
        self.with_active(|active| Ok(active.exceptions.len()))
    }

    /// Report a failure of `peer` to every handler in registration order, then purge the peer.
    pub fn notify_exception(&self, peer: ProcessName, kind: ExceptionKind) -> Result<()> {
        let handlers = self.with_active(|active| Ok(active.exceptions.snapshot()))?;
        tracing::warn!(
            rank = %self.me,
            peer = %peer,
            %kind,
            handlers = handlers.len(),
            "peer exception"
        );
        for handler in &handlers {
            handler.on_exception(&peer, kind);
        }
        match self.purge(peer) {
            Ok(_) | Err(RmlError::NotInitialized) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Drop every unfinished operation addressed to `peer` and evict its cached address.
    ///
    /// Removed operations report [`OpStatus::Purged`]. Receives posted for any
    /// peer are unaffected. Returns the number of operations removed.
    pub fn purge(&self, peer: ProcessName) -> Result<usize> {
        let fires = {
            let mut guard = self.lock()?;
            let active = guard.as_mut().ok_or(RmlError::NotInitialized)?;
            let mut settled: HashMap<OpKey, OpStatus> = HashMap::new();
            let pending = &active.pending;
            active.local_done.retain(|(key, status)| {
                let ours = pending.get(*key).is_some_and(|op| op.targets(&peer));
                if ours {
                    settled.insert(*key, status.clone());
                }
                !ours
            });
            let mut keys = active.pending.targeting(&peer);
            keys.extend(settled.keys().copied());
            keys.sort_unstable();
            let mut fires: Vec<Fire> = Vec::with_capacity(keys.len());
            for key in &keys {
                let status = settled.remove(key).unwrap_or(OpStatus::Purged);
                if let Some(op) = active.withdraw(*key) {
                    fires.extend(op.finish(status));
                }
            }
            let av = active.res.av()?;
            let evicted = active.resolver.evict(&peer, av);
            tracing::debug!(peer = %peer, removed = keys.len(), evicted, "purged peer");
            self.park_orphans(&mut fires)?;
            fires
        };
        let removed = fires.len();
        self.dispatch(fires);
        Ok(removed)
    }
}
