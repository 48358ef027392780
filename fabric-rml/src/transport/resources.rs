//! Fabric object lifecycle: the ordered acquire sequence and reverse teardown.

use crate::config::RmlConfig;
use crate::error::{Result, RmlError};
use crate::fabric::{
    AddressVector, AvAttr, AvType, BindFlags, CompletionQueue, CqAttr, CqFormat, Domain, Endpoint,
    EndpointName, Fabric, FabricHints, InitStep, NAME_MAX, Provider, ProviderInfo,
};
use std::sync::Arc;

/// Open fabric handles.
///
/// Fields are filled in acquisition order. Dropping releases whatever was
/// opened in the reverse order: endpoint, address vector, completion queue,
/// domain, fabric. A failed [`open`](Self::open) therefore leaves nothing live.
pub(crate) struct FabricResources {
    pub(crate) info: ProviderInfo,
    fabric: Option<Box<dyn Fabric>>,
    domain: Option<Box<dyn Domain>>,
    cq: Option<Arc<dyn CompletionQueue>>,
    av: Option<Arc<dyn AddressVector>>,
    endpoint: Option<Box<dyn Endpoint>>,
}

impl FabricResources {
    fn empty(info: ProviderInfo) -> Self {
        Self {
            info,
            fabric: None,
            domain: None,
            cq: None,
            av: None,
            endpoint: None,
        }
    }

    /// Negotiate capabilities, select a provider, and open every object the transport needs.
    ///
    /// Returns the resources together with the exported local endpoint name.
    pub(crate) fn open(provider: &dyn Provider, config: &RmlConfig) -> Result<(Self, EndpointName)> {
        let hints = FabricHints::rml();
        let infos = provider
            .getinfo(config.fabric_version, &hints)
            .map_err(at(InitStep::GetInfo))?;
        let info = select_provider(infos, &hints, config).ok_or_else(|| {
            let e = RmlError::init(InitStep::SelectProvider, "no acceptable provider");
            tracing::error!(step = %InitStep::SelectProvider, "fabric initialization failed");
            e
        })?;
        tracing::info!(
            provider = %info.provider_name,
            fabric = %info.fabric_name,
            inject_size = info.inject_size,
            "selected fabric provider"
        );

        let mut res = Self::empty(info);
        let fabric = provider
            .fabric(&res.info)
            .map_err(at(InitStep::FabricOpen))?;
        let domain = res.fabric.insert(fabric).domain(&res.info).map_err(at(InitStep::DomainOpen))?;
        let domain = res.domain.insert(domain);
        let endpoint = domain
            .endpoint(&res.info)
            .map_err(at(InitStep::EndpointOpen))?;
        let cq = domain
            .cq_open(&CqAttr {
                format: CqFormat::Tagged,
                size: config.cq_size,
            })
            .map_err(at(InitStep::CqOpen))?;
        res.cq = Some(Arc::clone(&cq));
        let av = domain
            .av_open(&AvAttr {
                av_type: AvType::Map,
            })
            .map_err(at(InitStep::AvOpen))?;
        res.av = Some(Arc::clone(&av));

        let endpoint = res.endpoint.insert(endpoint);
        endpoint
            .bind_cq(&cq, BindFlags::SEND_RECV)
            .map_err(at(InitStep::BindCq))?;
        endpoint.bind_av(&av).map_err(at(InitStep::BindAv))?;
        endpoint.enable().map_err(at(InitStep::Enable))?;
        let name = endpoint.name().map_err(at(InitStep::GetName))?;
        Ok((res, name))
    }

    pub(crate) fn endpoint(&self) -> Result<&dyn Endpoint> {
        self.endpoint.as_deref().ok_or(RmlError::NotInitialized)
    }

    pub(crate) fn av(&self) -> Result<&dyn AddressVector> {
        self.av.as_deref().ok_or(RmlError::NotInitialized)
    }

    pub(crate) fn cq(&self) -> Result<&dyn CompletionQueue> {
        self.cq.as_deref().ok_or(RmlError::NotInitialized)
    }
}

impl Drop for FabricResources {
    fn drop(&mut self) {
        drop(self.endpoint.take());
        drop(self.av.take());
        drop(self.cq.take());
        drop(self.domain.take());
        if self.fabric.take().is_some() {
            tracing::debug!(provider = %self.info.provider_name, "fabric resources released");
        }
    }
}

fn at(step: InitStep) -> impl FnOnce(RmlError) -> RmlError {
    move |e| {
        tracing::error!(step = %step, error = %e, "fabric initialization failed");
        match e {
            RmlError::InitFailed { .. } => e,
            other => RmlError::init(step, other.to_string()),
        }
    }
}

/// Pick the provider to use among those returned by discovery.
///
/// Providers on the exclude list, or not meeting the hints, are skipped. If an
/// include list is configured, the first listed name with an acceptable
/// provider wins; otherwise the first acceptable provider in discovery order.
pub(crate) fn select_provider(
    infos: Vec<ProviderInfo>,
    hints: &FabricHints,
    config: &RmlConfig,
) -> Option<ProviderInfo> {
    let mut acceptable: Vec<ProviderInfo> = infos
        .into_iter()
        .filter(|i| i.satisfies(hints) && i.max_addr_len <= NAME_MAX)
        .filter(|i| !config.provider_exclude.contains(&i.provider_name))
        .collect();
    if config.provider_include.is_empty() {
        return acceptable.into_iter().next();
    }
    config.provider_include.iter().find_map(|want| {
        let idx = acceptable.iter().position(|i| &i.provider_name == want)?;
        Some(acceptable.swap_remove(idx))
    })
}
