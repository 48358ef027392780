use super::helpers::*;
use fabric_rml::{OpStatus, PeerMatch, RmlError};
use std::time::Duration;

#[test]
fn test_cancel_fires_exactly_once() {
    let p = connected_pair(fast_config());
    let (log, rcb) = recv_log();
    p.b.receive(PeerMatch::Any, 12, false, rcb).unwrap();
    p.b.cancel_receive(PeerMatch::Any, 12).unwrap();
    assert_eq!(len_of(&log), 1);
    assert_eq!(log.lock().unwrap()[0].status, OpStatus::Cancelled);
    assert_eq!(log.lock().unwrap()[0].sender, None);

    // a message arriving afterwards is not delivered to the cancelled receive
    let (_, cb) = send_log();
    p.a.send(B, &[b"late"], 12, cb()).unwrap();
    drive_for(&[&p.a, &p.b], Duration::from_millis(30));
    assert_eq!(len_of(&log), 1);
    assert_eq!(p.b.pending_count().unwrap(), 0);
}

#[test]
fn test_cancel_unknown_receive() {
    let p = connected_pair(fast_config());
    let err = p.b.cancel_receive(PeerMatch::Peer(A), 1).unwrap_err();
    assert!(matches!(err, RmlError::ReceiveNotFound { .. }));
    assert!(err.is_usage());
}

#[test]
fn test_cancelled_slot_can_be_reposted() {
    let p = connected_pair(fast_config());
    let (_, first) = recv_log();
    p.b.receive(PeerMatch::Any, 13, true, first).unwrap();
    p.b.cancel_receive(PeerMatch::Any, 13).unwrap();

    let (log, second) = recv_log();
    p.b.receive(PeerMatch::Any, 13, false, second).unwrap();
    let (_, cb) = send_log();
    p.a.send(B, &[b"again"], 13, cb()).unwrap();
    assert!(drive_until(&[&p.a, &p.b], Duration::from_secs(2), || len_of(&log) == 1));
    assert_eq!(log.lock().unwrap()[0].payload, b"again");
}
