//! QoS-tagged logical channels multiplexed over the shared endpoint.

use super::Transport;
use super::messaging::SendTarget;
use crate::error::{Result, RmlError};
use crate::fabric::{ProviderInfo, TrafficClass};
use crate::protocol::HEADER_SIZE;
use crate::types::{ChannelId, OpKey, ProcessName, SendCallback, Tag};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// Quality-of-service request for a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QosAttributes {
    pub traffic_class: TrafficClass,
    /// Send deadline for traffic on this channel; the transport default if `None`.
    pub timeout: Option<Duration>,
    /// Largest payload accepted on this channel; the provider limit if `None`.
    pub max_msg_size: Option<usize>,
}

impl Default for QosAttributes {
    fn default() -> Self {
        Self {
            traffic_class: TrafficClass::BestEffort,
            timeout: None,
            max_msg_size: None,
        }
    }
}

impl QosAttributes {
    /// Check the request against what the endpoint's provider declared.
    pub fn validate(&self, info: &ProviderInfo) -> Result<()> {
        if !info.supports_class(self.traffic_class) {
            return Err(RmlError::QosUnsupported {
                reason: format!("traffic class {:?}", self.traffic_class),
            });
        }
        if let Some(max) = self.max_msg_size
            && max
                .checked_add(HEADER_SIZE)
                .is_none_or(|framed| framed > info.max_msg_size)
        {
            return Err(RmlError::QosUnsupported {
                reason: format!(
                    "max message size {max} exceeds provider limit {}",
                    info.max_msg_size.saturating_sub(HEADER_SIZE)
                ),
            });
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(RmlError::QosUnsupported {
                reason: "zero timeout".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Opening,
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    Opened,
    Closed,
}

/// Fired once from `progress()` when an open or close request takes effect.
pub type ChannelCallback = Box<dyn FnOnce(ChannelId, ChannelEvent) + Send>;

struct Channel {
    peer: ProcessName,
    qos: QosAttributes,
    state: ChannelState,
}

pub(crate) struct ChannelTable {
    next: u32,
    channels: HashMap<ChannelId, Channel>,
    events: VecDeque<(ChannelId, ChannelEvent, ChannelCallback)>,
}

impl Default for ChannelTable {
    fn default() -> Self {
        Self {
            next: 1,
            channels: HashMap::new(),
            events: VecDeque::new(),
        }
    }
}

impl ChannelTable {
    pub(crate) fn open(
        &mut self,
        peer: ProcessName,
        qos: QosAttributes,
        callback: ChannelCallback,
    ) -> ChannelId {
        let id = ChannelId(self.next);
        // zero means "no channel" on the wire
        self.next = self.next.wrapping_add(1).max(1);
        self.channels.insert(
            id,
            Channel {
                peer,
                qos,
                state: ChannelState::Opening,
            },
        );
        self.events.push_back((id, ChannelEvent::Opened, callback));
        id
    }

    pub(crate) fn close(&mut self, id: ChannelId, callback: ChannelCallback) -> Result<()> {
        self.channels
            .remove(&id)
            .ok_or(RmlError::UnknownChannel { channel: id })?;
        self.events.push_back((id, ChannelEvent::Closed, callback));
        Ok(())
    }

    /// Peer and send parameters for traffic on an open channel.
    pub(crate) fn route(&self, id: ChannelId) -> Result<(ProcessName, &QosAttributes)> {
        let ch = self
            .channels
            .get(&id)
            .ok_or(RmlError::UnknownChannel { channel: id })?;
        if ch.state != ChannelState::Open {
            return Err(RmlError::ChannelNotOpen { channel: id });
        }
        Ok((ch.peer, &ch.qos))
    }

    pub(crate) fn state(&self, id: ChannelId) -> Option<ChannelState> {
        self.channels.get(&id).map(|c| c.state)
    }

    /// Apply queued open/close transitions, returning the callbacks to fire.
    pub(crate) fn take_events(&mut self) -> Vec<(ChannelId, ChannelEvent, ChannelCallback)> {
        let events: Vec<_> = self.events.drain(..).collect();
        for (id, event, _) in &events {
            if *event == ChannelEvent::Opened
                && let Some(ch) = self.channels.get_mut(id)
            {
                ch.state = ChannelState::Open;
            }
        }
        events
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.channels.len()
    }
}

impl Transport {
    /// Request a channel to `peer`. The QoS attributes are checked now; the
    /// channel opens and `callback` fires on the next `progress()`.
    pub fn open_channel(
        &self,
        peer: ProcessName,
        qos: QosAttributes,
        callback: ChannelCallback,
    ) -> Result<ChannelId> {
        self.with_active(|active| {
            qos.validate(&active.res.info)?;
            let id = active.channels.open(peer, qos, callback);
            tracing::debug!(peer = %peer, channel = %id, "channel requested");
            Ok(id)
        })
    }

    /// Send over an open channel, using its peer and QoS deadline.
    pub fn send_channel(
        &self,
        channel: ChannelId,
        regions: &[&[u8]],
        tag: Tag,
        callback: SendCallback,
    ) -> Result<OpKey> {
        self.submit_send(SendTarget::Channel(channel), regions, tag, callback)
    }

    pub fn send_channel_buffer(
        &self,
        channel: ChannelId,
        buf: Vec<u8>,
        tag: Tag,
        callback: SendCallback,
    ) -> Result<OpKey> {
        self.send_channel(channel, &[&buf], tag, callback)
    }

    /// Release the channel. Sends already posted on it complete normally.
    pub fn close_channel(&self, channel: ChannelId, callback: ChannelCallback) -> Result<()> {
        self.with_active(|active| {
            active.channels.close(channel, callback)?;
            tracing::debug!(channel = %channel, "channel closed");
            Ok(())
        })
    }

    pub fn channel_state(&self, channel: ChannelId) -> Result<Option<ChannelState>> {
        self.with_active(|active| Ok(active.channels.state(channel)))
    }
}
