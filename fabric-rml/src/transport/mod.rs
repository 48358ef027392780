//! The fabric-backed transport context.
//!
//! A [`Transport`] owns one set of fabric resources and everything built on
//! them: the address resolver, pending operations, exception handlers, and
//! channels. All of it sits behind a single lock. Posting calls hold the lock
//! only while posting; callbacks and exception handlers always run after it
//! is released, so they may call back into the transport.

pub(crate) mod buffer_pool;
pub mod channel;
pub mod exception;
pub mod lifecycle;
pub(crate) mod messaging;
pub(crate) mod pending;
mod progress;
pub(crate) mod resolver;
pub(crate) mod resources;

pub use channel::{ChannelCallback, ChannelEvent, ChannelState, QosAttributes};
pub use exception::{ExceptionHandler, ExceptionKind};
pub use lifecycle::{FtObserver, FtState};

use crate::config::RmlConfig;
use crate::error::{Result, RmlError};
use crate::fabric::{EndpointName, FabricAddr, InitStep, Provider, ProviderInfo};
use crate::protocol::{HEADER_SIZE, MessageKind, fabric_tag, format_uri, parse_uri};
use crate::types::{OpKey, OpStatus, ProcessName, RecvCompletion};
use buffer_pool::RecvPool;
use channel::ChannelTable;
use exception::ExceptionRegistry;
use pending::{PendingOp, PendingSet};
use progress::Outcome;
use resolver::AddressResolver;
use resources::FabricResources;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

/// Probe-sink receives match any application tag in the probe class.
const PROBE_IGNORE: u64 = u32::MAX as u64;

/// Result of [`Transport::initialize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStatus {
    /// Resources were acquired by this call.
    Fresh,
    /// The transport was already running; nothing was acquired.
    AlreadyInitialized,
}

/// State carried across a restart.
struct Preserved {
    contacts: HashMap<ProcessName, EndpointName>,
    handlers: Vec<Arc<dyn exception::ExceptionHandler>>,
}

/// Live state of an initialized transport.
pub(crate) struct Active {
    pub(crate) res: FabricResources,
    pub(crate) local: EndpointName,
    pub(crate) resolver: AddressResolver,
    pub(crate) pending: PendingSet,
    pub(crate) exceptions: ExceptionRegistry,
    pub(crate) channels: ChannelTable,
    /// Sends waiting for their peer's contact, in submission order.
    pub(crate) deferred: VecDeque<OpKey>,
    /// Operations settled without a fabric completion.
    pub(crate) local_done: VecDeque<(OpKey, OpStatus)>,
    pub(crate) pool: RecvPool,
    pub(crate) last_sweep: Instant,
}

impl Active {
    /// Drop the active state, releasing fabric resources last.
    fn release(self, keep: bool) -> Option<Preserved> {
        let Active {
            res,
            resolver,
            exceptions,
            ..
        } = self;
        let preserved = keep.then(|| Preserved {
            contacts: resolver.into_contacts(),
            handlers: exceptions.into_handlers(),
        });
        drop(res);
        preserved
    }
}

/// Tag-matched messaging over a reliable-datagram fabric.
pub struct Transport {
    me: ProcessName,
    config: RmlConfig,
    provider: Arc<dyn Provider>,
    state: Mutex<Option<Active>>,
    /// Final receive completions waiting for a callback that is currently out.
    orphans: Mutex<HashMap<OpKey, RecvCompletion>>,
    ft_observer: Mutex<Option<Arc<dyn lifecycle::FtObserver>>>,
    next_key: AtomicU64,
}

impl Transport {
    /// Create an uninitialized transport for the local process `me`.
    pub fn new(me: ProcessName, provider: Arc<dyn Provider>, config: RmlConfig) -> Self {
        Self {
            me,
            config,
            provider,
            state: Mutex::new(None),
            orphans: Mutex::new(HashMap::new()),
            ft_observer: Mutex::new(None),
            next_key: AtomicU64::new(1),
        }
    }

    pub fn me(&self) -> ProcessName {
        self.me
    }

    pub fn config(&self) -> &RmlConfig {
        &self.config
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Option<Active>>> {
        self.state
            .lock()
            .map_err(|_| RmlError::LockPoisoned("transport state"))
    }

    pub(crate) fn with_active<R>(&self, f: impl FnOnce(&mut Active) -> Result<R>) -> Result<R> {
        let mut guard = self.lock()?;
        let active = guard.as_mut().ok_or(RmlError::NotInitialized)?;
        f(active)
    }

    pub(crate) fn next_key(&self) -> OpKey {
        OpKey(self.next_key.fetch_add(1, Ordering::Relaxed))
    }

    pub fn is_initialized(&self) -> bool {
        self.lock().map(|g| g.is_some()).unwrap_or(false)
    }

    /// Acquire fabric resources and start accepting operations.
    ///
    /// Calling this on a running transport is a no-op reporting
    /// [`InitStatus::AlreadyInitialized`]. On failure every resource opened so
    /// far has been released and the transport stays uninitialized.
    pub fn initialize(&self) -> Result<InitStatus> {
        self.bring_up(None)
    }

    fn bring_up(&self, preserved: Option<Preserved>) -> Result<InitStatus> {
        let mut guard = self.lock()?;
        if guard.is_some() {
            tracing::debug!(rank = %self.me, "transport already initialized");
            return Ok(InitStatus::AlreadyInitialized);
        }
        let active = self.open_active(preserved)?;
        tracing::info!(
            rank = %self.me,
            provider = %active.res.info.provider_name,
            addr_len = active.local.len(),
            "transport initialized"
        );
        *guard = Some(active);
        Ok(InitStatus::Fresh)
    }

    fn open_active(&self, preserved: Option<Preserved>) -> Result<Active> {
        let (res, local) = FabricResources::open(self.provider.as_ref(), &self.config)?;
        let (resolver, exceptions) = match preserved {
            Some(p) => (
                AddressResolver::with_contacts(p.contacts),
                ExceptionRegistry::from_handlers(p.handlers),
            ),
            None => (AddressResolver::default(), ExceptionRegistry::default()),
        };
        let mut active = Active {
            res,
            local,
            resolver,
            pending: PendingSet::default(),
            exceptions,
            channels: ChannelTable::default(),
            deferred: VecDeque::new(),
            local_done: VecDeque::new(),
            pool: RecvPool::new(
                self.config.recv_pool_size,
                self.config.max_recv_size.max(HEADER_SIZE),
            ),
            last_sweep: Instant::now(),
        };
        let sink = self.next_key();
        active.pending.insert(PendingOp::probe_sink(
            sink,
            fabric_tag(MessageKind::Probe, 0),
            PROBE_IGNORE,
        ))?;
        active
            .rearm(sink)
            .map_err(|e| RmlError::init(InitStep::Enable, format!("probe receive: {e}")))?;
        Ok(active)
    }

    /// Release every pending operation, then the exception handlers, then the
    /// fabric resources. Pending callbacks fire with [`OpStatus::Shutdown`].
    pub fn finalize(&self) -> Result<()> {
        self.teardown(false).map(|_| ())
    }

    fn teardown(&self, keep: bool) -> Result<Option<Preserved>> {
        let (fires, active) = {
            let mut guard = self.lock()?;
            let Some(mut active) = guard.take() else {
                return Ok(None);
            };
            let mut out = Outcome::default();
            active.drain_channel_events(&mut out);
            active.deferred.clear();
            let mut settled: HashMap<OpKey, OpStatus> = active.local_done.drain(..).collect();
            for op in active.pending.drain() {
                let status = settled.remove(&op.key).unwrap_or(OpStatus::Shutdown);
                out.fires.extend(op.finish(status));
            }
            self.park_orphans(&mut out.fires)?;
            (out.fires, active)
        };
        let released = fires.len();
        self.dispatch(fires);
        let preserved = active.release(keep);
        tracing::info!(rank = %self.me, released, "transport finalized");
        Ok(preserved)
    }

    /// Exported address of the local endpoint.
    pub fn export_local_address(&self) -> Result<EndpointName> {
        self.with_active(|active| Ok(active.local.clone()))
    }

    /// Contact URI of this process.
    pub fn get_uri(&self) -> Result<String> {
        self.with_active(|active| Ok(format_uri(&self.me, &active.local)))
    }

    /// Record the contact advertised in `uri`. Returns the peer it names.
    pub fn set_uri(&self, uri: &str) -> Result<ProcessName> {
        let (peer, name) = parse_uri(uri)?;
        self.set_contact(peer, name)?;
        Ok(peer)
    }

    /// Record where `peer` can be reached and post any sends queued for it.
    ///
    /// Returns the number of queued sends that were posted.
    pub fn set_contact(&self, peer: ProcessName, name: EndpointName) -> Result<usize> {
        self.with_active(|active| {
            active.resolver.set_contact(peer, name, active.res.av()?);
            Ok(active.flush_deferred(&peer))
        })
    }

    /// Fabric handle currently cached for `peer`, if any.
    pub fn cached_address(&self, peer: &ProcessName) -> Result<Option<FabricAddr>> {
        self.with_active(|active| Ok(active.resolver.cached(peer)))
    }

    /// Number of caller-visible operations still pending.
    pub fn pending_count(&self) -> Result<usize> {
        self.with_active(|active| Ok(active.pending.len()))
    }

    /// Number of sends waiting for contact information.
    pub fn deferred_count(&self) -> Result<usize> {
        self.with_active(|active| Ok(active.deferred.len()))
    }

    pub fn provider_info(&self) -> Result<ProviderInfo> {
        self.with_active(|active| Ok(active.res.info.clone()))
    }

    /// Largest message the provider delivers inline.
    pub fn max_inject_size(&self) -> Result<usize> {
        self.with_active(|active| Ok(active.res.info.inject_size))
    }
}
