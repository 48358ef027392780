use super::helpers::*;
use fabric_rml::fabric::TrafficClass;
use fabric_rml::{
    ChannelCallback, ChannelEvent, ChannelId, ChannelState, OpStatus, PeerMatch, QosAttributes,
    RmlError,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type EventLog = Arc<Mutex<Vec<(ChannelId, ChannelEvent)>>>;

fn channel_log() -> (EventLog, impl Fn() -> ChannelCallback) {
    let log: EventLog = Arc::default();
    let l = Arc::clone(&log);
    let make = move || -> ChannelCallback {
        let l = Arc::clone(&l);
        Box::new(move |id, event| l.lock().unwrap().push((id, event)))
    };
    (log, make)
}

#[test]
fn test_channel_open_send_close() {
    let p = connected_pair(fast_config());
    let (events, cb) = channel_log();
    let id = p.a.open_channel(B, QosAttributes::default(), cb()).unwrap();
    assert_ne!(id.0, 0);
    assert_eq!(p.a.channel_state(id).unwrap(), Some(ChannelState::Opening));

    let (_, scb) = send_log();
    let err = p.a.send_channel(id, &[b"early"], 1, scb()).unwrap_err();
    assert!(matches!(err, RmlError::ChannelNotOpen { .. }));

    p.a.progress().unwrap();
    assert_eq!(*events.lock().unwrap(), vec![(id, ChannelEvent::Opened)]);
    assert_eq!(p.a.channel_state(id).unwrap(), Some(ChannelState::Open));

    let (log, rcb) = recv_log();
    p.b.receive(PeerMatch::Any, 1, false, rcb).unwrap();
    let (sent, scb) = send_log();
    p.a.send_channel(id, &[b"over the channel"], 1, scb()).unwrap();
    assert!(drive_until(&[&p.a, &p.b], Duration::from_secs(2), || {
        len_of(&log) == 1 && len_of(&sent) == 1
    }));
    let got = &log.lock().unwrap()[0];
    assert_eq!(got.channel, Some(id));
    assert_eq!(got.payload, b"over the channel");
    assert_eq!(sent.lock().unwrap()[0].channel, Some(id));

    p.a.close_channel(id, cb()).unwrap();
    p.a.progress().unwrap();
    assert_eq!(events.lock().unwrap()[1], (id, ChannelEvent::Closed));
    assert_eq!(p.a.channel_state(id).unwrap(), None);
    let (_, scb) = send_log();
    assert!(matches!(
        p.a.send_channel(id, &[b"late"], 1, scb()),
        Err(RmlError::UnknownChannel { .. })
    ));
    assert!(matches!(
        p.a.close_channel(id, cb()),
        Err(RmlError::UnknownChannel { .. })
    ));
}

#[test]
fn test_unsupported_qos_rejected() {
    let p = connected_pair(fast_config());
    let (events, cb) = channel_log();
    let qos = QosAttributes {
        traffic_class: TrafficClass::Scavenger,
        ..QosAttributes::default()
    };
    assert!(matches!(
        p.a.open_channel(B, qos, cb()),
        Err(RmlError::QosUnsupported { .. })
    ));
    let qos = QosAttributes {
        max_msg_size: Some(usize::MAX),
        ..QosAttributes::default()
    };
    assert!(matches!(
        p.a.open_channel(B, qos, cb()),
        Err(RmlError::QosUnsupported { .. })
    ));
    p.a.progress().unwrap();
    assert!(events.lock().unwrap().is_empty());
}

#[test]
fn test_channel_limits_apply_to_its_sends() {
    let p = connected_pair(fast_config());
    let (_, cb) = channel_log();
    let qos = QosAttributes {
        traffic_class: TrafficClass::LowLatency,
        timeout: Some(Duration::from_millis(30)),
        max_msg_size: Some(512),
    };
    let id = p.a.open_channel(B, qos, cb()).unwrap();
    p.a.progress().unwrap();

    let (_, scb) = send_log();
    assert!(matches!(
        p.a.send_channel_buffer(id, vec![0; 513], 1, scb()),
        Err(RmlError::MessageTooLarge { len: 513, max: 512 })
    ));

    // the channel deadline is shorter than the transport default
    p.net.blackhole(&p.b.export_local_address().unwrap());
    let (sent, scb) = send_log();
    p.a.send_channel_buffer(id, vec![0; 256], 1, scb()).unwrap();
    assert!(drive_until(&[&p.a], Duration::from_millis(150), || len_of(&sent) == 1));
    assert_eq!(sent.lock().unwrap()[0].status, OpStatus::TimedOut);
}
