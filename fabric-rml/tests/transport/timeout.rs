use super::helpers::*;
use fabric_rml::{ExceptionHandler, ExceptionKind, FailureKind, OpStatus, PeerMatch};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[test]
fn test_send_to_silent_peer_times_out_and_raises_exception() {
    let p = connected_pair(fast_config());
    let first = Arc::new(Recorder::default());
    let second = Arc::new(Recorder::default());
    p.a.add_exception(first.clone()).unwrap();
    p.a.add_exception(second.clone()).unwrap();
    p.net.blackhole(&p.b.export_local_address().unwrap());

    let (sent, cb) = send_log();
    let started = Instant::now();
    // above the inline limit so the send waits on a fabric completion
    p.a.send_buffer(B, vec![0; 256], 8, cb()).unwrap();
    assert!(drive_until(&[&p.a], Duration::from_secs(3), || len_of(&sent) == 1));
    let elapsed = started.elapsed();

    assert_eq!(sent.lock().unwrap()[0].status, OpStatus::TimedOut);
    assert!(elapsed >= Duration::from_millis(200), "fired after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "fired after {elapsed:?}");
    for r in [&first, &second] {
        assert_eq!(*r.seen.lock().unwrap(), vec![(B, ExceptionKind::Unreachable)]);
    }
    assert_eq!(p.a.cached_address(&B).unwrap(), None);
    assert_eq!(p.a.pending_count().unwrap(), 0);
}

#[test]
fn test_timeouts_to_one_peer_escalate_once_per_sweep() {
    let p = connected_pair(fast_config());
    let r = Arc::new(Recorder::default());
    p.a.add_exception(r.clone()).unwrap();
    p.net.blackhole(&p.b.export_local_address().unwrap());

    let (sent, cb) = send_log();
    for tag in 0..3 {
        p.a.send_buffer(B, vec![0; 256], tag, cb()).unwrap();
    }
    assert!(drive_until(&[&p.a], Duration::from_secs(3), || len_of(&sent) == 3));
    // the first expiry escalates; the purge that follows may take the rest
    let sent = sent.lock().unwrap();
    assert_eq!(sent[0].status, OpStatus::TimedOut);
    assert!(
        sent.iter()
            .all(|c| matches!(c.status, OpStatus::TimedOut | OpStatus::Purged))
    );
    assert_eq!(r.count(), 1);
}

#[test]
fn test_timeout_escalation_can_be_disabled() {
    let mut config = fast_config();
    config.escalate_timeouts = false;
    let p = connected_pair(config);
    let r = Arc::new(Recorder::default());
    p.a.add_exception(r.clone()).unwrap();
    p.net.blackhole(&p.b.export_local_address().unwrap());

    let (sent, cb) = send_log();
    p.a.send_buffer(B, vec![0; 256], 1, cb()).unwrap();
    assert!(drive_until(&[&p.a], Duration::from_secs(3), || len_of(&sent) == 1));
    assert_eq!(sent.lock().unwrap()[0].status, OpStatus::TimedOut);
    assert_eq!(r.count(), 0);
    assert!(p.a.cached_address(&B).unwrap().is_some());
}

#[test]
fn test_one_shot_receive_deadline() {
    let mut config = fast_config();
    config.recv_timeout = Some(Duration::from_millis(50));
    let p = connected_pair(config);
    let r = Arc::new(Recorder::default());
    p.b.add_exception(r.clone()).unwrap();
    let (once, cb) = recv_log();
    p.b.receive(PeerMatch::Peer(A), 1, false, cb).unwrap();
    let (forever, pcb) = recv_log();
    p.b.receive(PeerMatch::Any, 2, true, pcb).unwrap();

    assert!(drive_until(&[&p.b], Duration::from_secs(2), || len_of(&once) == 1));
    assert_eq!(once.lock().unwrap()[0].status, OpStatus::TimedOut);
    drive_for(&[&p.b], Duration::from_millis(80));
    assert_eq!(len_of(&forever), 0);
    assert_eq!(r.count(), 0);
}

#[test]
fn test_send_to_closed_endpoint_fails_and_purges() {
    let p = connected_pair(fast_config());
    let r = Arc::new(Recorder::default());
    p.a.add_exception(r.clone()).unwrap();
    let (recv, rcb) = recv_log();
    p.a.receive(PeerMatch::Peer(B), 4, false, rcb).unwrap();
    p.b.finalize().unwrap();

    let (sent, cb) = send_log();
    p.a.send_buffer(B, vec![0; 256], 4, cb()).unwrap();
    assert!(drive_until(&[&p.a], Duration::from_secs(2), || len_of(&sent) == 1));

    assert_eq!(
        sent.lock().unwrap()[0].status,
        OpStatus::Failed(FailureKind::Unreachable)
    );
    assert_eq!(*r.seen.lock().unwrap(), vec![(B, ExceptionKind::Unreachable)]);
    assert_eq!(recv.lock().unwrap()[0].status, OpStatus::Purged);
}

#[test]
fn test_inline_send_to_closed_endpoint_reports_post_failure() {
    let p = connected_pair(fast_config());
    p.b.finalize().unwrap();
    let (sent, cb) = send_log();
    p.a.send(B, &[b"tiny"], 4, cb()).unwrap();
    assert!(drive_until(&[&p.a], Duration::from_secs(2), || len_of(&sent) == 1));
    assert!(matches!(
        sent.lock().unwrap()[0].status,
        OpStatus::Failed(FailureKind::Post(_))
    ));
}

#[test]
fn test_removed_handler_is_not_notified() {
    let p = connected_pair(fast_config());
    let kept = Arc::new(Recorder::default());
    let removed = Arc::new(Recorder::default());
    let removed_handle: Arc<dyn ExceptionHandler> = removed.clone();
    p.a.add_exception(kept.clone()).unwrap();
    p.a.add_exception(Arc::clone(&removed_handle)).unwrap();
    p.a.remove_exception(&removed_handle).unwrap();
    assert_eq!(p.a.exception_handlers().unwrap(), 1);
    p.net.blackhole(&p.b.export_local_address().unwrap());

    let (sent, cb) = send_log();
    p.a.send_buffer(B, vec![0; 256], 9, cb()).unwrap();
    assert!(drive_until(&[&p.a], Duration::from_secs(3), || len_of(&sent) == 1));
    assert_eq!(sent.lock().unwrap()[0].status, OpStatus::TimedOut);
    assert_eq!(kept.count(), 1);
    assert_eq!(removed.count(), 0);
}
