//! Downward interface: the subset of fabric operations the transport consumes.
//!
//! A provider hands out a chain of objects (fabric → domain → endpoint,
//! completion queue, address vector). Every object releases its fabric
//! resource when dropped. Receive buffers are moved into the endpoint when
//! posted and come back inside the completion entry.

mod info;
pub mod mem;

pub use info::{
    Caps, EndpointType, FabricHints, FabricVersion, MsgOrder, Progress, ProviderInfo, Threading,
    TrafficClass,
};

use crate::error::{Result, RmlError};
use std::sync::Arc;

/// Maximum length of an endpoint address.
pub const NAME_MAX: usize = 64;

/// Opaque, exportable endpoint address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointName(Vec<u8>);

impl EndpointName {
    pub fn new(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() > NAME_MAX {
            return Err(RmlError::InvalidAddress {
                len: bytes.len(),
                max: NAME_MAX,
            });
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Fabric-native address handle returned by address-vector insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FabricAddr(pub u64);

impl FabricAddr {
    /// Matches any source on receive.
    pub const UNSPEC: FabricAddr = FabricAddr(u64::MAX);
}

/// Steps of transport initialization, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InitStep {
    GetInfo,
    SelectProvider,
    FabricOpen,
    DomainOpen,
    EndpointOpen,
    CqOpen,
    AvOpen,
    BindCq,
    BindAv,
    Enable,
    GetName,
}

impl InitStep {
    pub const ALL: [InitStep; 11] = [
        InitStep::GetInfo,
        InitStep::SelectProvider,
        InitStep::FabricOpen,
        InitStep::DomainOpen,
        InitStep::EndpointOpen,
        InitStep::CqOpen,
        InitStep::AvOpen,
        InitStep::BindCq,
        InitStep::BindAv,
        InitStep::Enable,
        InitStep::GetName,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            InitStep::GetInfo => "getinfo",
            InitStep::SelectProvider => "select_provider",
            InitStep::FabricOpen => "fabric_open",
            InitStep::DomainOpen => "domain_open",
            InitStep::EndpointOpen => "endpoint_open",
            InitStep::CqOpen => "cq_open",
            InitStep::AvOpen => "av_open",
            InitStep::BindCq => "bind_cq",
            InitStep::BindAv => "bind_av",
            InitStep::Enable => "enable",
            InitStep::GetName => "getname",
        }
    }
}

impl std::fmt::Display for InitStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Kind of fabric object, used for resource accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Fabric,
    Domain,
    Endpoint,
    CompletionQueue,
    AddressVector,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CqFormat {
    /// Entries carry context, length, and tag.
    Tagged,
}

#[derive(Debug, Clone)]
pub struct CqAttr {
    pub format: CqFormat,
    pub size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvType {
    /// Handles are opaque values chosen by the provider.
    Map,
    /// Handles are dense indices.
    Table,
}

#[derive(Debug, Clone)]
pub struct AvAttr {
    pub av_type: AvType,
}

/// Which operations a bound completion queue reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindFlags {
    pub send: bool,
    pub recv: bool,
}

impl BindFlags {
    pub const SEND_RECV: BindFlags = BindFlags {
        send: true,
        recv: true,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CqOp {
    Send,
    Recv,
}

/// A successful completion.
#[derive(Debug)]
pub struct CqEntry {
    pub context: u64,
    pub op: CqOp,
    /// Bytes transferred.
    pub len: usize,
    pub tag: u64,
    /// The posted receive buffer, truncated to `len`. `None` for sends.
    pub buf: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CqErrorKind {
    Truncated { len: usize },
    Cancelled,
    Unreachable,
    ConnectionLost,
    Other(i32),
}

/// A failed completion.
#[derive(Debug)]
pub struct CqErrEntry {
    pub context: u64,
    pub op: CqOp,
    pub kind: CqErrorKind,
    pub buf: Option<Vec<u8>>,
}

#[derive(Debug)]
pub enum CqEvent {
    Done(CqEntry),
    Error(CqErrEntry),
}

impl CqEvent {
    pub fn context(&self) -> u64 {
        match self {
            CqEvent::Done(e) => e.context,
            CqEvent::Error(e) => e.context,
        }
    }
}

/// Entry point of a fabric provider.
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Discover fabrics matching `hints`. Does not allocate resources.
    fn getinfo(&self, version: FabricVersion, hints: &FabricHints) -> Result<Vec<ProviderInfo>>;

    fn fabric(&self, info: &ProviderInfo) -> Result<Box<dyn Fabric>>;
}

pub trait Fabric: Send + Sync {
    fn domain(&self, info: &ProviderInfo) -> Result<Box<dyn Domain>>;
}

pub trait Domain: Send + Sync {
    fn endpoint(&self, info: &ProviderInfo) -> Result<Box<dyn Endpoint>>;

    fn cq_open(&self, attr: &CqAttr) -> Result<Arc<dyn CompletionQueue>>;

    fn av_open(&self, attr: &AvAttr) -> Result<Arc<dyn AddressVector>>;
}

/// A local communication endpoint. Posting calls never block.
pub trait Endpoint: Send + Sync {
    fn bind_cq(&mut self, cq: &Arc<dyn CompletionQueue>, flags: BindFlags) -> Result<()>;

    fn bind_av(&mut self, av: &Arc<dyn AddressVector>) -> Result<()>;

    /// Commit bindings; the endpoint accepts traffic afterwards.
    fn enable(&mut self) -> Result<()>;

    /// Exportable address of this endpoint.
    fn name(&self) -> Result<EndpointName>;

    /// Tagged send reported on the completion queue with `context`.
    fn tsend(&self, data: Vec<u8>, dest: FabricAddr, tag: u64, context: u64) -> Result<()>;

    /// Tagged send that generates no completion; `data.len()` must not exceed `inject_size`.
    fn tinject(&self, data: Vec<u8>, dest: FabricAddr, tag: u64) -> Result<()>;

    /// Tagged receive into `buf`; bits set in `ignore` are excluded from tag matching.
    fn trecv(&self, buf: Vec<u8>, src: FabricAddr, tag: u64, ignore: u64, context: u64)
    -> Result<()>;

    /// Cancel a posted receive; it completes with `CqErrorKind::Cancelled`.
    fn cancel(&self, context: u64) -> Result<()>;
}

pub trait CompletionQueue: Send + Sync {
    /// Move up to `max` available events into `out` without blocking.
    fn read(&self, max: usize, out: &mut Vec<CqEvent>) -> Result<usize>;

    /// Lets a provider recover its own queue type when an endpoint is bound.
    fn as_any(&self) -> &dyn std::any::Any;
}

pub trait AddressVector: Send + Sync {
    fn insert(&self, name: &EndpointName) -> Result<FabricAddr>;

    fn remove(&self, addr: FabricAddr) -> Result<()>;

    fn lookup(&self, addr: FabricAddr) -> Option<EndpointName>;
}
