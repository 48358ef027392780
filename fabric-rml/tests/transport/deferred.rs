use super::helpers::*;
use fabric_rml::{OpStatus, PeerMatch, ProcessName, RmlError};
use std::time::Duration;

#[test]
fn test_sends_wait_for_contact_then_flush_in_order() {
    let p = unconnected_pair(fast_config());
    let (sent, cb) = send_log();
    p.a.send(B, &[b"first"], 5, cb()).unwrap();
    p.a.send(B, &[b"second"], 5, cb()).unwrap();
    assert_eq!(p.a.deferred_count().unwrap(), 2);
    drive_for(&[&p.a], Duration::from_millis(20));
    assert_eq!(len_of(&sent), 0);

    let (log, rcb) = recv_log();
    p.b.receive(PeerMatch::Any, 5, true, rcb).unwrap();
    let uri = p.b.get_uri().unwrap();
    let name = p.b.export_local_address().unwrap();
    assert_eq!(p.a.set_contact(B, name).unwrap(), 2);
    assert_eq!(p.a.deferred_count().unwrap(), 0);
    // repeating the same contact posts nothing new
    p.a.set_uri(&uri).unwrap();

    assert!(drive_until(&[&p.a, &p.b], Duration::from_secs(2), || len_of(&log) == 2));
    let payloads: Vec<Vec<u8>> = log.lock().unwrap().iter().map(|c| c.payload.clone()).collect();
    assert_eq!(payloads, vec![b"first".to_vec(), b"second".to_vec()]);
    assert!(drive_until(&[&p.a], Duration::from_secs(1), || len_of(&sent) == 2));
}

#[test]
fn test_deferred_send_still_times_out() {
    let p = unconnected_pair(fast_config());
    let (sent, cb) = send_log();
    p.a.send(ProcessName::new(3, 3), &[b"nobody"], 1, cb()).unwrap();
    assert!(drive_until(&[&p.a], Duration::from_secs(2), || len_of(&sent) == 1));
    assert_eq!(sent.lock().unwrap()[0].status, OpStatus::TimedOut);
    assert_eq!(p.a.deferred_count().unwrap(), 0);
}

#[test]
fn test_unresolved_send_fails_fast_without_deferral() {
    let mut config = fast_config();
    config.defer_unresolved = false;
    let p = unconnected_pair(config);
    let (sent, cb) = send_log();
    assert!(matches!(
        p.a.send(B, &[b"x"], 1, cb()),
        Err(RmlError::NoContact { peer }) if peer == B
    ));
    assert_eq!(p.a.pending_count().unwrap(), 0);
    assert_eq!(len_of(&sent), 0);
}

#[test]
fn test_peer_receive_needs_contact() {
    let p = unconnected_pair(fast_config());
    let (_, rcb) = recv_log();
    assert!(matches!(
        p.b.receive(PeerMatch::Peer(A), 1, false, rcb),
        Err(RmlError::NoContact { .. })
    ));
}
