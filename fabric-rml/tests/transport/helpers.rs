use fabric_rml::{
    ExceptionHandler, ExceptionKind, MemNetwork, MemProvider, ProcessName, RecvCallback,
    RecvCompletion, RmlConfig, SendCallback, SendCompletion, Transport,
};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const A: ProcessName = ProcessName::new(7, 0);
pub const B: ProcessName = ProcessName::new(7, 1);

/// Short deadlines so failure paths finish quickly.
pub fn fast_config() -> RmlConfig {
    RmlConfig {
        send_timeout: Duration::from_millis(200),
        sweep_interval: Duration::from_millis(10),
        max_recv_size: 4096,
        recv_pool_size: 8,
        ..RmlConfig::default()
    }
}

pub struct Pair {
    pub net: Arc<MemNetwork>,
    pub a: Arc<Transport>,
    pub b: Arc<Transport>,
}

/// Build an initialized transport for `me` on `net`.
pub fn transport(net: &Arc<MemNetwork>, me: ProcessName, config: RmlConfig) -> Arc<Transport> {
    let t = Arc::new(Transport::new(me, Arc::new(MemProvider::new(net)), config));
    t.initialize().unwrap();
    t
}

/// Two initialized transports on one network, without contact exchange.
pub fn unconnected_pair(config: RmlConfig) -> Pair {
    let net = MemNetwork::new();
    let a = transport(&net, A, config.clone());
    let b = transport(&net, B, config);
    Pair { net, a, b }
}

/// Two initialized transports that know each other's URI.
pub fn connected_pair(config: RmlConfig) -> Pair {
    let pair = unconnected_pair(config);
    exchange(&pair.a, &pair.b);
    pair
}

pub fn exchange(a: &Transport, b: &Transport) {
    assert_eq!(a.set_uri(&b.get_uri().unwrap()).unwrap(), b.me());
    assert_eq!(b.set_uri(&a.get_uri().unwrap()).unwrap(), a.me());
}

/// Call `progress()` on every transport until `cond` holds or `timeout` passes.
pub fn drive_until(ts: &[&Transport], timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        for t in ts {
            t.progress().unwrap();
        }
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Drive for a fixed period, for asserting that nothing happens.
pub fn drive_for(ts: &[&Transport], period: Duration) {
    drive_until(ts, period, || false);
}

pub fn send_log() -> (Arc<Mutex<Vec<SendCompletion>>>, impl Fn() -> SendCallback) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let l = Arc::clone(&log);
    let make = move || -> SendCallback {
        let l = Arc::clone(&l);
        Box::new(move |c| l.lock().unwrap().push(c))
    };
    (log, make)
}

pub fn recv_log() -> (Arc<Mutex<Vec<RecvCompletion>>>, RecvCallback) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let l = Arc::clone(&log);
    (log, Box::new(move |c| l.lock().unwrap().push(c)))
}

pub fn len_of<T>(log: &Arc<Mutex<Vec<T>>>) -> usize {
    log.lock().unwrap().len()
}

/// Exception handler recording every notification.
#[derive(Default)]
pub struct Recorder {
    pub seen: Mutex<Vec<(ProcessName, ExceptionKind)>>,
}

impl ExceptionHandler for Recorder {
    fn on_exception(&self, peer: &ProcessName, kind: ExceptionKind) {
        self.seen.lock().unwrap().push((*peer, kind));
    }
}

impl Recorder {
    pub fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}
