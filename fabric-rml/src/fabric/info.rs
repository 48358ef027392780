//! Capability negotiation: the hints a transport requests and the info a provider advertises.

/// Fabric interface version a caller is coded against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FabricVersion {
    pub major: u16,
    pub minor: u16,
}

impl FabricVersion {
    pub const V1_0: FabricVersion = FabricVersion { major: 1, minor: 0 };
}

impl std::fmt::Display for FabricVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointType {
    /// Connection-oriented messaging.
    Msg,
    /// Reliable datagram.
    Rdm,
    /// Unreliable datagram.
    Dgram,
}

/// Capability bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Caps(u32);

impl Caps {
    pub const MSG: Caps = Caps(1 << 0);
    pub const TAGGED: Caps = Caps(1 << 1);
    pub const RMA: Caps = Caps(1 << 2);
    pub const SOURCE: Caps = Caps(1 << 3);

    pub const fn empty() -> Self {
        Caps(0)
    }

    pub const fn contains(self, other: Caps) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Caps {
    type Output = Caps;

    fn bitor(self, rhs: Caps) -> Caps {
        Caps(self.0 | rhs.0)
    }
}

/// Delivery ordering guarantee between messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MsgOrder {
    None,
    /// Sends to the same target with the same tag are delivered in order.
    SendAfterSend,
}

/// Threading model of a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Threading {
    /// Provider serializes all access internally.
    Safe,
    /// Caller serializes access per endpoint.
    Endpoint,
    /// Caller serializes access per domain.
    Domain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Auto,
    Manual,
}

/// Traffic class a channel can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrafficClass {
    BestEffort,
    LowLatency,
    BulkData,
    Scavenger,
}

/// What the transport asks of a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FabricHints {
    pub ep_type: EndpointType,
    pub caps: Caps,
    pub tx_order: MsgOrder,
    pub rx_order: MsgOrder,
    pub threading: Threading,
    pub control_progress: Progress,
    /// Operations carry a caller context used to match completions.
    pub context_mode: bool,
}

impl FabricHints {
    /// Reliable datagram with tag matching, ordered same-tag delivery, and
    /// endpoint-level serialized access.
    pub fn rml() -> Self {
        Self {
            ep_type: EndpointType::Rdm,
            caps: Caps::TAGGED,
            tx_order: MsgOrder::SendAfterSend,
            rx_order: MsgOrder::SendAfterSend,
            threading: Threading::Endpoint,
            control_progress: Progress::Auto,
            context_mode: true,
        }
    }
}

/// What a provider advertises during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderInfo {
    pub provider_name: String,
    pub fabric_name: String,
    pub ep_type: EndpointType,
    pub caps: Caps,
    pub tx_order: MsgOrder,
    pub rx_order: MsgOrder,
    pub threading: Threading,
    pub control_progress: Progress,
    /// Largest message that may be sent inline without a completion.
    pub inject_size: usize,
    pub max_msg_size: usize,
    pub max_addr_len: usize,
    pub traffic_classes: Vec<TrafficClass>,
}

impl ProviderInfo {
    /// Whether this provider meets every requirement in `hints`.
    pub fn satisfies(&self, hints: &FabricHints) -> bool {
        self.ep_type == hints.ep_type
            && self.caps.contains(hints.caps)
            && self.tx_order >= hints.tx_order
            && self.rx_order >= hints.rx_order
            && (self.threading == hints.threading || self.threading == Threading::Safe)
            && (self.control_progress == hints.control_progress
                || hints.control_progress == Progress::Manual)
    }

    pub fn supports_class(&self, class: TrafficClass) -> bool {
        self.traffic_classes.contains(&class)
    }
}
