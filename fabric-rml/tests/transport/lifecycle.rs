use super::helpers::*;
use fabric_rml::{FtState, OpStatus, PeerMatch, RmlError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[test]
fn test_finalize_completes_pending_with_shutdown() {
    let p = connected_pair(fast_config());
    let (once, cb) = recv_log();
    p.a.receive(PeerMatch::Peer(B), 1, false, cb).unwrap();
    let (forever, pcb) = recv_log();
    p.a.receive(PeerMatch::Any, 2, true, pcb).unwrap();
    p.net.blackhole(&p.b.export_local_address().unwrap());
    let (sent, scb) = send_log();
    p.a.send_buffer(B, vec![0; 256], 3, scb()).unwrap();

    p.a.finalize().unwrap();
    assert_eq!(once.lock().unwrap()[0].status, OpStatus::Shutdown);
    assert_eq!(forever.lock().unwrap()[0].status, OpStatus::Shutdown);
    assert_eq!(sent.lock().unwrap()[0].status, OpStatus::Shutdown);
    assert!(matches!(p.a.pending_count(), Err(RmlError::NotInitialized)));
    assert!(matches!(p.a.progress(), Err(RmlError::NotInitialized)));
}

#[test]
fn test_reinitialize_after_finalize_starts_clean() {
    let p = connected_pair(fast_config());
    p.a.add_exception(Arc::new(Recorder::default())).unwrap();
    p.a.finalize().unwrap();
    p.a.initialize().unwrap();
    assert_eq!(p.a.exception_handlers().unwrap(), 0);
    assert_eq!(p.a.pending_count().unwrap(), 0);
    // contacts went with the old state
    let (_, cb) = send_log();
    p.a.send(B, &[b"x"], 1, cb()).unwrap();
    assert_eq!(p.a.deferred_count().unwrap(), 1);
}

#[test]
fn test_checkpoint_events_reach_observer() {
    let p = connected_pair(fast_config());
    let seen: Arc<Mutex<Vec<FtState>>> = Arc::default();
    let s = Arc::clone(&seen);
    p.a.set_ft_observer(Some(Arc::new(move |state: FtState| s.lock().unwrap().push(state))))
        .unwrap();
    let uri = p.a.get_uri().unwrap();

    p.a.ft_event(FtState::Checkpoint).unwrap();
    p.a.ft_event(FtState::Continue).unwrap();
    p.a.ft_event(FtState::Term).unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![FtState::Checkpoint, FtState::Continue]);
    assert_eq!(p.a.get_uri().unwrap(), uri);
}

#[test]
fn test_restart_reopens_resources_and_keeps_handlers() {
    let p = connected_pair(fast_config());
    let seen: Arc<Mutex<Vec<FtState>>> = Arc::default();
    let s = Arc::clone(&seen);
    p.a.set_ft_observer(Some(Arc::new(move |state: FtState| s.lock().unwrap().push(state))))
        .unwrap();
    p.a.add_exception(Arc::new(Recorder::default())).unwrap();
    let (pending, cb) = recv_log();
    p.a.receive(PeerMatch::Any, 1, true, cb).unwrap();
    let old_uri = p.a.get_uri().unwrap();

    p.a.ft_event(FtState::Restart).unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![FtState::Restart]);
    assert_eq!(pending.lock().unwrap()[0].status, OpStatus::Shutdown);
    assert!(p.a.is_initialized());
    assert_eq!(p.a.exception_handlers().unwrap(), 1);
    assert_ne!(p.a.get_uri().unwrap(), old_uri);
    assert_eq!(p.a.cached_address(&B).unwrap(), None);
    assert_eq!(p.net.live_resources(), 10);

    // the contact for B survived, so sends go out without a new exchange
    let (log, rcb) = recv_log();
    p.b.receive(PeerMatch::Any, 2, false, rcb).unwrap();
    let (_, scb) = send_log();
    p.a.send(B, &[b"back"], 2, scb()).unwrap();
    assert_eq!(p.a.deferred_count().unwrap(), 0);
    assert!(drive_until(&[&p.a, &p.b], Duration::from_secs(2), || len_of(&log) == 1));
    assert_eq!(log.lock().unwrap()[0].sender, Some(A));
}
