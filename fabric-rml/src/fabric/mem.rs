//! In-process fabric provider.
//!
//! Every endpoint opened from providers sharing one [`MemNetwork`] can reach
//! every other. Matching follows reliable-datagram tag semantics: an incoming
//! message takes the oldest posted receive it matches, otherwise it waits in
//! an ordered unexpected queue that new receives scan first. Sends complete
//! eagerly once the payload has been handed to the target.
//!
//! Faults are injected through the network: [`MemNetwork::blackhole`] drops
//! traffic to an endpoint without any completion, sends to a closed endpoint
//! complete with `Unreachable`, and [`MemProviderConfig::fail_at`] makes one
//! initialization step fail.

use super::{
    AddressVector, AvAttr, BindFlags, Caps, CompletionQueue, CqAttr, CqEntry, CqErrEntry,
    CqErrorKind, CqEvent, CqOp, Domain, Endpoint, EndpointName, EndpointType, Fabric, FabricAddr,
    FabricHints, FabricVersion, InitStep, MsgOrder, Progress, Provider, ProviderInfo, ResourceKind,
    Threading, TrafficClass,
};
use crate::error::{Result, RmlError};
use crossbeam_queue::ArrayQueue;
use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// First handle handed out by an address vector.
const AV_HANDLE_BASE: u64 = 0x1000;

/// Shared medium connecting in-process endpoints.
pub struct MemNetwork {
    inner: Mutex<NetState>,
    next_endpoint: AtomicU64,
}

#[derive(Default)]
struct NetState {
    endpoints: HashMap<EndpointName, Arc<EndpointShared>>,
    blackholed: HashSet<EndpointName>,
    live: HashMap<ResourceKind, usize>,
    close_log: Vec<ResourceKind>,
}

enum Route {
    Deliver(Arc<EndpointShared>),
    Blackhole,
    Closed,
}

impl MemNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(NetState::default()),
            next_endpoint: AtomicU64::new(1),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, NetState>> {
        self.inner
            .lock()
            .map_err(|_| RmlError::LockPoisoned("mem network"))
    }

    /// Silently drop all traffic addressed to `name` until [`heal`](Self::heal).
    pub fn blackhole(&self, name: &EndpointName) {
        if let Ok(mut st) = self.lock() {
            st.blackholed.insert(name.clone());
        }
    }

    pub fn heal(&self, name: &EndpointName) {
        if let Ok(mut st) = self.lock() {
            st.blackholed.remove(name);
        }
    }

    /// Number of open objects of one kind.
    pub fn live(&self, kind: ResourceKind) -> usize {
        self.lock()
            .map(|st| st.live.get(&kind).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Number of open objects of any kind.
    pub fn live_resources(&self) -> usize {
        self.lock().map(|st| st.live.values().sum()).unwrap_or(0)
    }

    /// Kinds of objects closed so far, in close order.
    pub fn close_log(&self) -> Vec<ResourceKind> {
        self.lock().map(|st| st.close_log.clone()).unwrap_or_default()
    }

    pub fn clear_close_log(&self) {
        if let Ok(mut st) = self.lock() {
            st.close_log.clear();
        }
    }

    fn route(&self, dest: &EndpointName) -> Result<Route> {
        let st = self.lock()?;
        if st.blackholed.contains(dest) {
            return Ok(Route::Blackhole);
        }
        Ok(match st.endpoints.get(dest) {
            Some(ep) => Route::Deliver(Arc::clone(ep)),
            None => Route::Closed,
        })
    }
}

/// Counts one open object; the count drops when the tracker does.
struct Tracker {
    net: Arc<MemNetwork>,
    kind: ResourceKind,
}

impl Tracker {
    fn open(net: &Arc<MemNetwork>, kind: ResourceKind) -> Result<Self> {
        *net.lock()?.live.entry(kind).or_insert(0) += 1;
        Ok(Self {
            net: Arc::clone(net),
            kind,
        })
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        if let Ok(mut st) = self.net.inner.lock() {
            if let Some(n) = st.live.get_mut(&self.kind) {
                *n = n.saturating_sub(1);
            }
            st.close_log.push(self.kind);
        }
    }
}

fn fail_if(fail_at: Option<InitStep>, step: InitStep, op: &'static str) -> Result<()> {
    if fail_at == Some(step) {
        return Err(RmlError::fabric(op, "injected failure"));
    }
    Ok(())
}

/// Provider behaviour knobs.
#[derive(Debug, Clone)]
pub struct MemProviderConfig {
    pub name: String,
    /// Infos returned by discovery, in order.
    pub infos: Vec<ProviderInfo>,
    /// Make this initialization step fail.
    pub fail_at: Option<InitStep>,
}

impl MemProviderConfig {
    /// Info for a well-behaved in-process fabric named `name`.
    pub fn info(name: &str) -> ProviderInfo {
        ProviderInfo {
            provider_name: name.to_string(),
            fabric_name: format!("{name}0"),
            ep_type: EndpointType::Rdm,
            caps: Caps::TAGGED | Caps::MSG | Caps::SOURCE,
            tx_order: MsgOrder::SendAfterSend,
            rx_order: MsgOrder::SendAfterSend,
            threading: Threading::Safe,
            control_progress: Progress::Auto,
            inject_size: 64,
            max_msg_size: 1 << 20,
            max_addr_len: 12,
            traffic_classes: vec![
                TrafficClass::BestEffort,
                TrafficClass::LowLatency,
                TrafficClass::BulkData,
            ],
        }
    }

    pub fn fail_at(mut self, step: InitStep) -> Self {
        self.fail_at = Some(step);
        self
    }
}

impl Default for MemProviderConfig {
    fn default() -> Self {
        Self {
            name: "mem".into(),
            infos: vec![Self::info("mem")],
            fail_at: None,
        }
    }
}

pub struct MemProvider {
    net: Arc<MemNetwork>,
    config: MemProviderConfig,
}

impl MemProvider {
    pub fn new(net: &Arc<MemNetwork>) -> Self {
        Self::with_config(net, MemProviderConfig::default())
    }

    pub fn with_config(net: &Arc<MemNetwork>, config: MemProviderConfig) -> Self {
        Self {
            net: Arc::clone(net),
            config,
        }
    }
}

impl Provider for MemProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn getinfo(&self, version: FabricVersion, hints: &FabricHints) -> Result<Vec<ProviderInfo>> {
        fail_if(self.config.fail_at, InitStep::GetInfo, "getinfo")?;
        if version.major != 1 {
            return Err(RmlError::fabric(
                "getinfo",
                format!("unsupported version {version}"),
            ));
        }
        if self.config.fail_at == Some(InitStep::SelectProvider) {
            return Ok(Vec::new());
        }
        Ok(self
            .config
            .infos
            .iter()
            .filter(|i| i.satisfies(hints))
            .cloned()
            .collect())
    }

    fn fabric(&self, _info: &ProviderInfo) -> Result<Box<dyn Fabric>> {
        fail_if(self.config.fail_at, InitStep::FabricOpen, "fabric")?;
        Ok(Box::new(MemFabric {
            _tracker: Tracker::open(&self.net, ResourceKind::Fabric)?,
            net: Arc::clone(&self.net),
            fail_at: self.config.fail_at,
        }))
    }
}

struct MemFabric {
    _tracker: Tracker,
    net: Arc<MemNetwork>,
    fail_at: Option<InitStep>,
}

impl Fabric for MemFabric {
    fn domain(&self, _info: &ProviderInfo) -> Result<Box<dyn Domain>> {
        fail_if(self.fail_at, InitStep::DomainOpen, "domain")?;
        Ok(Box::new(MemDomain {
            _tracker: Tracker::open(&self.net, ResourceKind::Domain)?,
            net: Arc::clone(&self.net),
            fail_at: self.fail_at,
        }))
    }
}

struct MemDomain {
    _tracker: Tracker,
    net: Arc<MemNetwork>,
    fail_at: Option<InitStep>,
}

impl Domain for MemDomain {
    fn endpoint(&self, info: &ProviderInfo) -> Result<Box<dyn Endpoint>> {
        fail_if(self.fail_at, InitStep::EndpointOpen, "endpoint")?;
        let id = self.net.next_endpoint.fetch_add(1, Ordering::Relaxed);
        let mut name = b"mem\0".to_vec();
        name.extend_from_slice(&id.to_le_bytes());
        Ok(Box::new(MemEndpoint {
            _tracker: Tracker::open(&self.net, ResourceKind::Endpoint)?,
            net: Arc::clone(&self.net),
            shared: Arc::new(EndpointShared {
                name: EndpointName::new(name)?,
                rx: Mutex::new(RxState::default()),
                cq: Mutex::new(None),
            }),
            av: None,
            inject_size: info.inject_size,
            enabled: false,
            fail_at: self.fail_at,
        }))
    }

    fn cq_open(&self, attr: &CqAttr) -> Result<Arc<dyn CompletionQueue>> {
        fail_if(self.fail_at, InitStep::CqOpen, "cq_open")?;
        Ok(Arc::new(MemCq {
            _tracker: Tracker::open(&self.net, ResourceKind::CompletionQueue)?,
            queue: ArrayQueue::new(attr.size.max(1)),
            overrun: AtomicBool::new(false),
        }))
    }

    fn av_open(&self, _attr: &AvAttr) -> Result<Arc<dyn AddressVector>> {
        fail_if(self.fail_at, InitStep::AvOpen, "av_open")?;
        Ok(Arc::new(MemAv {
            _tracker: Tracker::open(&self.net, ResourceKind::AddressVector)?,
            inner: Mutex::new(AvState::default()),
        }))
    }
}

struct MemCq {
    _tracker: Tracker,
    queue: ArrayQueue<CqEvent>,
    overrun: AtomicBool,
}

impl MemCq {
    fn push(&self, ev: CqEvent) {
        if let Err(ev) = self.queue.push(ev) {
            tracing::error!(
                context = ev.context(),
                "mem cq: completion queue full, event lost"
            );
            self.overrun.store(true, Ordering::Release);
        }
    }
}

impl CompletionQueue for MemCq {
    fn read(&self, max: usize, out: &mut Vec<CqEvent>) -> Result<usize> {
        if self.overrun.swap(false, Ordering::AcqRel) {
            return Err(RmlError::fabric("cq_read", "completion queue overrun"));
        }
        let mut n = 0;
        while n < max {
            match self.queue.pop() {
                Some(ev) => {
                    out.push(ev);
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Default)]
struct AvState {
    next: u64,
    by_addr: HashMap<u64, EndpointName>,
    by_name: HashMap<EndpointName, u64>,
}

struct MemAv {
    _tracker: Tracker,
    inner: Mutex<AvState>,
}

impl AddressVector for MemAv {
    fn insert(&self, name: &EndpointName) -> Result<FabricAddr> {
        let mut av = self
            .inner
            .lock()
            .map_err(|_| RmlError::LockPoisoned("mem av"))?;
        if let Some(&addr) = av.by_name.get(name) {
            return Ok(FabricAddr(addr));
        }
        let addr = AV_HANDLE_BASE + av.next;
        av.next += 1;
        av.by_addr.insert(addr, name.clone());
        av.by_name.insert(name.clone(), addr);
        Ok(FabricAddr(addr))
    }

    fn remove(&self, addr: FabricAddr) -> Result<()> {
        let mut av = self
            .inner
            .lock()
            .map_err(|_| RmlError::LockPoisoned("mem av"))?;
        let name = av
            .by_addr
            .remove(&addr.0)
            .ok_or_else(|| RmlError::fabric("av_remove", format!("unknown address {addr:?}")))?;
        av.by_name.remove(&name);
        Ok(())
    }

    fn lookup(&self, addr: FabricAddr) -> Option<EndpointName> {
        self.inner.lock().ok()?.by_addr.get(&addr.0).cloned()
    }
}

struct PostedRecv {
    src: Option<EndpointName>,
    tag: u64,
    ignore: u64,
    context: u64,
    buf: Vec<u8>,
}

impl PostedRecv {
    fn matches(&self, src: &EndpointName, tag: u64) -> bool {
        self.src.as_ref().is_none_or(|s| s == src) && tags_match(self.tag, self.ignore, tag)
    }
}

struct Unexpected {
    src: EndpointName,
    tag: u64,
    data: Vec<u8>,
}

#[derive(Default)]
struct RxState {
    posted: VecDeque<PostedRecv>,
    unexpected: VecDeque<Unexpected>,
}

/// The part of an endpoint reachable by its peers.
struct EndpointShared {
    name: EndpointName,
    rx: Mutex<RxState>,
    cq: Mutex<Option<Arc<dyn CompletionQueue>>>,
}

impl EndpointShared {
    fn push(&self, ev: CqEvent) {
        let Ok(cq) = self.cq.lock() else {
            return;
        };
        match cq.as_ref().and_then(|q| q.as_any().downcast_ref::<MemCq>()) {
            Some(q) => q.push(ev),
            None => tracing::warn!(
                context = ev.context(),
                "mem endpoint: no completion queue bound, event dropped"
            ),
        }
    }

    /// Hand an incoming message to the oldest matching receive, or queue it.
    fn deliver(&self, src: &EndpointName, tag: u64, data: Vec<u8>) -> Result<()> {
        let mut rx = self
            .rx
            .lock()
            .map_err(|_| RmlError::LockPoisoned("mem endpoint rx"))?;
        match rx.posted.iter().position(|p| p.matches(src, tag)) {
            Some(idx) => {
                if let Some(posted) = rx.posted.remove(idx) {
                    self.push(complete_recv(posted, tag, &data));
                }
            }
            None => rx.unexpected.push_back(Unexpected {
                src: src.clone(),
                tag,
                data,
            }),
        }
        Ok(())
    }
}

fn tags_match(posted: u64, ignore: u64, incoming: u64) -> bool {
    (posted & !ignore) == (incoming & !ignore)
}

fn complete_recv(posted: PostedRecv, tag: u64, data: &[u8]) -> CqEvent {
    let mut buf = posted.buf;
    if data.len() > buf.len() {
        return CqEvent::Error(CqErrEntry {
            context: posted.context,
            op: CqOp::Recv,
            kind: CqErrorKind::Truncated { len: data.len() },
            buf: Some(buf),
        });
    }
    buf[..data.len()].copy_from_slice(data);
    buf.truncate(data.len());
    CqEvent::Done(CqEntry {
        context: posted.context,
        op: CqOp::Recv,
        len: data.len(),
        tag,
        buf: Some(buf),
    })
}

struct MemEndpoint {
    _tracker: Tracker,
    net: Arc<MemNetwork>,
    shared: Arc<EndpointShared>,
    av: Option<Arc<dyn AddressVector>>,
    inject_size: usize,
    enabled: bool,
    fail_at: Option<InitStep>,
}

impl MemEndpoint {
    fn check_enabled(&self, op: &'static str) -> Result<()> {
        if !self.enabled {
            return Err(RmlError::fabric(op, "endpoint not enabled"));
        }
        Ok(())
    }

    fn resolve(&self, op: &'static str, addr: FabricAddr) -> Result<EndpointName> {
        self.av
            .as_ref()
            .and_then(|av| av.lookup(addr))
            .ok_or_else(|| RmlError::fabric(op, format!("address {addr:?} not in address vector")))
    }

    fn transmit(&self, op: &'static str, data: Vec<u8>, dest: FabricAddr, tag: u64) -> Result<Route> {
        self.check_enabled(op)?;
        let dest_name = self.resolve(op, dest)?;
        let route = self.net.route(&dest_name)?;
        if let Route::Deliver(target) = &route {
            target.deliver(&self.shared.name, tag, data)?;
        }
        Ok(route)
    }
}

impl Endpoint for MemEndpoint {
    fn bind_cq(&mut self, cq: &Arc<dyn CompletionQueue>, flags: BindFlags) -> Result<()> {
        fail_if(self.fail_at, InitStep::BindCq, "bind_cq")?;
        if cq.as_any().downcast_ref::<MemCq>().is_none() {
            return Err(RmlError::fabric("bind_cq", "foreign completion queue"));
        }
        if !(flags.send && flags.recv) {
            return Err(RmlError::fabric("bind_cq", "send and recv must share one queue"));
        }
        *self
            .shared
            .cq
            .lock()
            .map_err(|_| RmlError::LockPoisoned("mem endpoint cq"))? = Some(Arc::clone(cq));
        Ok(())
    }

    fn bind_av(&mut self, av: &Arc<dyn AddressVector>) -> Result<()> {
        fail_if(self.fail_at, InitStep::BindAv, "bind_av")?;
        self.av = Some(Arc::clone(av));
        Ok(())
    }

    fn enable(&mut self) -> Result<()> {
        fail_if(self.fail_at, InitStep::Enable, "enable")?;
        if self.av.is_none() {
            return Err(RmlError::fabric("enable", "no address vector bound"));
        }
        let bound = self
            .shared
            .cq
            .lock()
            .map_err(|_| RmlError::LockPoisoned("mem endpoint cq"))?
            .is_some();
        if !bound {
            return Err(RmlError::fabric("enable", "no completion queue bound"));
        }
        self.net
            .lock()?
            .endpoints
            .insert(self.shared.name.clone(), Arc::clone(&self.shared));
        self.enabled = true;
        Ok(())
    }

    fn name(&self) -> Result<EndpointName> {
        fail_if(self.fail_at, InitStep::GetName, "getname")?;
        Ok(self.shared.name.clone())
    }

    fn tsend(&self, data: Vec<u8>, dest: FabricAddr, tag: u64, context: u64) -> Result<()> {
        let len = data.len();
        match self.transmit("tsend", data, dest, tag)? {
            Route::Deliver(_) => self.shared.push(CqEvent::Done(CqEntry {
                context,
                op: CqOp::Send,
                len,
                tag,
                buf: None,
            })),
            Route::Blackhole => tracing::trace!(context, "mem endpoint: send blackholed"),
            Route::Closed => self.shared.push(CqEvent::Error(CqErrEntry {
                context,
                op: CqOp::Send,
                kind: CqErrorKind::Unreachable,
                buf: None,
            })),
        }
        Ok(())
    }

    fn tinject(&self, data: Vec<u8>, dest: FabricAddr, tag: u64) -> Result<()> {
        if data.len() > self.inject_size {
            return Err(RmlError::fabric(
                "tinject",
                format!("{} bytes exceeds inject size {}", data.len(), self.inject_size),
            ));
        }
        match self.transmit("tinject", data, dest, tag)? {
            Route::Closed => Err(RmlError::fabric("tinject", "destination unreachable")),
            Route::Deliver(_) | Route::Blackhole => Ok(()),
        }
    }

    fn trecv(
        &self,
        buf: Vec<u8>,
        src: FabricAddr,
        tag: u64,
        ignore: u64,
        context: u64,
    ) -> Result<()> {
        self.check_enabled("trecv")?;
        let src = if src == FabricAddr::UNSPEC {
            None
        } else {
            Some(self.resolve("trecv", src)?)
        };
        let posted = PostedRecv {
            src,
            tag,
            ignore,
            context,
            buf,
        };
        let mut rx = self
            .shared
            .rx
            .lock()
            .map_err(|_| RmlError::LockPoisoned("mem endpoint rx"))?;
        let found = rx
            .unexpected
            .iter()
            .position(|u| posted.matches(&u.src, u.tag));
        match found.and_then(|idx| rx.unexpected.remove(idx)) {
            Some(msg) => self.shared.push(complete_recv(posted, msg.tag, &msg.data)),
            None => rx.posted.push_back(posted),
        }
        Ok(())
    }

    fn cancel(&self, context: u64) -> Result<()> {
        let mut rx = self
            .shared
            .rx
            .lock()
            .map_err(|_| RmlError::LockPoisoned("mem endpoint rx"))?;
        let idx = rx
            .posted
            .iter()
            .position(|p| p.context == context)
            .ok_or_else(|| RmlError::fabric("cancel", format!("context {context} not posted")))?;
        if let Some(posted) = rx.posted.remove(idx) {
            self.shared.push(CqEvent::Error(CqErrEntry {
                context,
                op: CqOp::Recv,
                kind: CqErrorKind::Cancelled,
                buf: Some(posted.buf),
            }));
        }
        Ok(())
    }
}

impl Drop for MemEndpoint {
    fn drop(&mut self) {
        if self.enabled
            && let Ok(mut st) = self.net.inner.lock()
        {
            st.endpoints.remove(&self.shared.name);
        }
    }
}
