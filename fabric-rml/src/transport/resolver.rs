use crate::error::{Result, RmlError};
use crate::fabric::{AddressVector, EndpointName, FabricAddr};
use crate::types::ProcessName;
use std::collections::HashMap;

/// Translates logical peer names into fabric address handles.
///
/// Contact information (the peer's exported endpoint name) is supplied from
/// outside. The fabric handle is created lazily by address-vector insertion on
/// first use and cached until the peer is purged or its contact changes.
#[derive(Default)]
pub(crate) struct AddressResolver {
    contacts: HashMap<ProcessName, EndpointName>,
    cache: HashMap<ProcessName, FabricAddr>,
}

impl AddressResolver {
    pub(crate) fn with_contacts(contacts: HashMap<ProcessName, EndpointName>) -> Self {
        Self {
            contacts,
            cache: HashMap::new(),
        }
    }

    /// Record where `peer` can be reached. A changed address drops the cached handle.
    pub(crate) fn set_contact(
        &mut self,
        peer: ProcessName,
        name: EndpointName,
        av: &dyn AddressVector,
    ) {
        if self.contacts.get(&peer) != Some(&name) {
            self.evict(&peer, av);
        }
        self.contacts.insert(peer, name);
    }

    pub(crate) fn contact(&self, peer: &ProcessName) -> Option<&EndpointName> {
        self.contacts.get(peer)
    }

    pub(crate) fn resolve(&mut self, peer: &ProcessName, av: &dyn AddressVector) -> Result<FabricAddr> {
        if let Some(&addr) = self.cache.get(peer) {
            return Ok(addr);
        }
        let name = self
            .contacts
            .get(peer)
            .ok_or(RmlError::NoContact { peer: *peer })?;
        let addr = av.insert(name)?;
        tracing::debug!(peer = %peer, ?addr, "resolved peer address");
        self.cache.insert(*peer, addr);
        Ok(addr)
    }

    /// Resolve an address advertised for `peer` without recording it as the peer's contact.
    ///
    /// Returns the handle and whether the caller owns it: an owned handle is
    /// not cached for any peer and must be handed to [`release`](Self::release).
    pub(crate) fn resolve_name(
        &mut self,
        peer: &ProcessName,
        name: &EndpointName,
        av: &dyn AddressVector,
    ) -> Result<(FabricAddr, bool)> {
        if self.contacts.get(peer) == Some(name) {
            return self.resolve(peer, av).map(|addr| (addr, false));
        }
        let addr = av.insert(name)?;
        Ok((addr, !self.is_cached(addr)))
    }

    /// Remove an owned handle from the address vector unless a peer has
    /// since cached the same handle.
    pub(crate) fn release(&self, addr: FabricAddr, av: &dyn AddressVector) {
        if self.is_cached(addr) {
            return;
        }
        if let Err(e) = av.remove(addr) {
            tracing::debug!(?addr, error = %e, "address vector removal failed");
        }
    }

    fn is_cached(&self, addr: FabricAddr) -> bool {
        self.cache.values().any(|a| *a == addr)
    }

    pub(crate) fn cached(&self, peer: &ProcessName) -> Option<FabricAddr> {
        self.cache.get(peer).copied()
    }

    /// Drop the cached handle for `peer`. Returns whether one was cached.
    pub(crate) fn evict(&mut self, peer: &ProcessName, av: &dyn AddressVector) -> bool {
        let Some(addr) = self.cache.remove(peer) else {
            return false;
        };
        if let Err(e) = av.remove(addr) {
            tracing::debug!(peer = %peer, error = %e, "address vector removal failed");
        }
        true
    }

    pub(crate) fn into_contacts(self) -> HashMap<ProcessName, EndpointName> {
        self.contacts
    }
}
