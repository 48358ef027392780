/// Job identifier half of a process name.
pub type JobId = u32;

/// Rank of a process within its job.
pub type Vpid = u32;

/// Application message tag.
pub type Tag = u32;

/// Logical identity of a peer process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessName {
    pub jobid: JobId,
    pub vpid: Vpid,
}

impl ProcessName {
    pub const fn new(jobid: JobId, vpid: Vpid) -> Self {
        Self { jobid, vpid }
    }
}

impl std::fmt::Display for ProcessName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{},{}]", self.jobid, self.vpid)
    }
}

/// Source filter for a receive: a specific peer or any peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerMatch {
    Any,
    Peer(ProcessName),
}

impl PeerMatch {
    /// Whether a message from `sender` satisfies this filter.
    pub fn matches(&self, sender: &ProcessName) -> bool {
        match self {
            PeerMatch::Any => true,
            PeerMatch::Peer(p) => p == sender,
        }
    }

    pub fn peer(&self) -> Option<ProcessName> {
        match self {
            PeerMatch::Any => None,
            PeerMatch::Peer(p) => Some(*p),
        }
    }
}

impl From<ProcessName> for PeerMatch {
    fn from(p: ProcessName) -> Self {
        PeerMatch::Peer(p)
    }
}

impl std::fmt::Display for PeerMatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerMatch::Any => f.write_str("*"),
            PeerMatch::Peer(p) => p.fmt(f),
        }
    }
}

/// Logical channel number. Zero is never allocated and means "no channel" on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u32);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Direction of a pending operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Send,
    Recv,
}

/// Why an operation failed after it was posted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// The incoming message did not fit the posted buffer.
    Truncated { len: usize },
    /// The fabric could not reach the peer.
    Unreachable,
    /// The connection to the peer was lost mid-operation.
    ConnectionLost,
    /// The message header could not be decoded.
    Malformed,
    /// Posting the operation to the endpoint failed.
    Post(String),
    /// Provider-specific error code.
    Fabric(i32),
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Truncated { len } => write!(f, "truncated ({len} bytes)"),
            FailureKind::Unreachable => f.write_str("peer unreachable"),
            FailureKind::ConnectionLost => f.write_str("connection lost"),
            FailureKind::Malformed => f.write_str("malformed header"),
            FailureKind::Post(reason) => write!(f, "post failed: {reason}"),
            FailureKind::Fabric(code) => write!(f, "fabric error {code}"),
        }
    }
}

/// Final status delivered to an operation callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpStatus {
    Success,
    /// The receive was cancelled before it matched.
    Cancelled,
    /// The local deadline expired before the fabric reported completion.
    TimedOut,
    /// The operation was dropped by a purge of its peer.
    Purged,
    /// The transport was finalized with the operation still pending.
    Shutdown,
    Failed(FailureKind),
}

impl OpStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, OpStatus::Success)
    }
}

/// Lifecycle of a pending operation record.
///
/// ```text
/// Posted ──► Completed | Failed | Cancelled | TimedOut
/// ```
///
/// A persistent receive returns to `Posted` after each completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpState {
    Posted,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl OpState {
    pub const fn is_terminal(self) -> bool {
        !matches!(self, OpState::Posted)
    }

    /// The state an operation lands in for a given final status.
    pub fn for_status(status: &OpStatus) -> Self {
        match status {
            OpStatus::Success => OpState::Completed,
            OpStatus::Cancelled | OpStatus::Purged | OpStatus::Shutdown => OpState::Cancelled,
            OpStatus::TimedOut => OpState::TimedOut,
            OpStatus::Failed(_) => OpState::Failed,
        }
    }
}

/// Correlation key linking a fabric completion back to its pending record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpKey(pub u64);

impl std::fmt::Display for OpKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "op{}", self.0)
    }
}

/// Outcome of a send, delivered to its callback.
#[derive(Debug, Clone)]
pub struct SendCompletion {
    pub peer: ProcessName,
    pub tag: Tag,
    pub channel: Option<ChannelId>,
    pub status: OpStatus,
    /// Payload bytes handed to the fabric (header excluded).
    pub bytes: usize,
}

/// Outcome of a receive, delivered to its callback.
#[derive(Debug, Clone)]
pub struct RecvCompletion {
    /// Sender of the matched message; `None` if nothing was delivered.
    pub sender: Option<ProcessName>,
    /// The filter the receive was posted with.
    pub posted_for: PeerMatch,
    pub tag: Tag,
    pub channel: Option<ChannelId>,
    pub status: OpStatus,
    pub payload: Vec<u8>,
}

impl RecvCompletion {
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Callback fired once when a send leaves the pending set.
pub type SendCallback = Box<dyn FnOnce(SendCompletion) + Send>;

/// Callback fired for each completion of a receive; persistent receives call it repeatedly.
pub type RecvCallback = Box<dyn FnMut(RecvCompletion) + Send>;
