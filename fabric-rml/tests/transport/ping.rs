use super::helpers::*;
use fabric_rml::{PeerMatch, ProgressDriver, RmlError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

#[test]
fn test_ping_reachable_peer() {
    let p = unconnected_pair(fast_config());
    let uri = p.b.get_uri().unwrap();
    assert!(p.a.ping(&uri, Duration::from_secs(1)).unwrap());
    // probes leave no trace on either side
    assert_eq!(p.a.pending_count().unwrap(), 0);
    assert_eq!(p.b.pending_count().unwrap(), 0);
    let (_, cb) = send_log();
    p.a.send(B, &[b"x"], 1, cb()).unwrap();
    assert_eq!(p.a.deferred_count().unwrap(), 1);
}

#[test]
fn test_ping_repeatedly() {
    let p = unconnected_pair(fast_config());
    let uri = p.b.get_uri().unwrap();
    for _ in 0..5 {
        assert!(p.a.ping(&uri, Duration::from_secs(1)).unwrap());
    }
}

#[test]
fn test_ping_silent_peer_returns_false_without_exception() {
    let p = connected_pair(fast_config());
    let r = Arc::new(Recorder::default());
    p.a.add_exception(r.clone()).unwrap();
    p.net.blackhole(&p.b.export_local_address().unwrap());

    let started = Instant::now();
    assert!(!p.a.ping(&p.b.get_uri().unwrap(), Duration::from_millis(50)).unwrap());
    assert!(started.elapsed() >= Duration::from_millis(50));
    drive_for(&[&p.a], Duration::from_millis(30));
    assert_eq!(r.count(), 0);
    assert_eq!(p.a.pending_count().unwrap(), 0);
}

#[test]
fn test_ping_without_deadline() {
    let p = unconnected_pair(fast_config());
    let uri = p.b.get_uri().unwrap();
    assert!(p.a.ping(&uri, Duration::MAX).unwrap());
    assert_eq!(p.a.pending_count().unwrap(), 0);
}

#[test]
fn test_ping_closed_peer() {
    let p = unconnected_pair(fast_config());
    let uri = p.b.get_uri().unwrap();
    p.b.finalize().unwrap();
    assert!(!p.a.ping(&uri, Duration::from_millis(200)).unwrap());
}

#[test]
fn test_ping_bad_uri() {
    let p = unconnected_pair(fast_config());
    assert!(matches!(
        p.a.ping("garbage", Duration::from_millis(10)),
        Err(RmlError::InvalidUri(_))
    ));
}

#[tokio::test]
async fn test_ping_async() {
    let p = unconnected_pair(fast_config());
    let uri = p.b.get_uri().unwrap();
    assert!(p.a.ping_async(&uri, Duration::from_secs(1)).await.unwrap());

    p.net.blackhole(&p.b.export_local_address().unwrap());
    assert!(!p.a.ping_async(&uri, Duration::from_millis(30)).await.unwrap());
}

#[tokio::test]
async fn test_ping_async_without_deadline() {
    let p = unconnected_pair(fast_config());
    let uri = p.b.get_uri().unwrap();
    let answered = tokio::time::timeout(Duration::from_secs(2), p.a.ping_async(&uri, Duration::MAX))
        .await
        .expect("ping did not finish");
    assert!(answered.unwrap());
}

#[tokio::test]
async fn test_awaitables_with_background_progress() {
    let p = connected_pair(fast_config());
    let da = ProgressDriver::spawn(Arc::clone(&p.a), Duration::from_millis(1));
    let db = ProgressDriver::spawn(Arc::clone(&p.b), Duration::from_millis(1));

    let rx = p.b.recv_awaitable(PeerMatch::Peer(A), 30).unwrap();
    let tx = p.a.send_awaitable(B, b"awaited".to_vec(), 30).unwrap();

    let got = tokio::time::timeout(Duration::from_secs(2), rx)
        .await
        .expect("receive timed out")
        .unwrap();
    assert_eq!(got.payload, b"awaited");
    let sent = tokio::time::timeout(Duration::from_secs(2), tx)
        .await
        .expect("send timed out")
        .unwrap();
    assert!(sent.status.is_success());

    assert!(!da.is_finished());
    da.stop().await;
    db.stop().await;
}

#[test]
fn test_operations_posted_while_another_thread_progresses() {
    let p = connected_pair(fast_config());
    let stop = AtomicBool::new(false);
    std::thread::scope(|s| {
        s.spawn(|| {
            while !stop.load(Ordering::Relaxed) {
                p.a.progress().unwrap();
                p.b.progress().unwrap();
                std::thread::yield_now();
            }
        });

        let (log, rcb) = recv_log();
        let (sent, cb) = send_log();
        p.b.receive(PeerMatch::Peer(A), 40, false, rcb).unwrap();
        p.a.send_buffer(B, vec![3; 256], 40, cb()).unwrap();
        p.a.send(B, &[b"small"], 41, cb()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while (len_of(&log) < 1 || len_of(&sent) < 2) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        stop.store(true, Ordering::Relaxed);

        assert_eq!(len_of(&sent), 2);
        assert!(sent.lock().unwrap().iter().all(|c| c.status.is_success()));
        assert_eq!(log.lock().unwrap()[0].payload, vec![3; 256]);
    });
}
