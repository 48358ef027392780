use super::helpers::*;
use fabric_rml::fabric::{InitStep, ResourceKind};
use fabric_rml::{
    InitStatus, MemNetwork, MemProvider, MemProviderConfig, PeerMatch, RmlError, Transport,
};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn test_failure_at_each_step_releases_everything() {
    for step in InitStep::ALL {
        let net = MemNetwork::new();
        let provider = MemProvider::with_config(&net, MemProviderConfig::default().fail_at(step));
        let t = Transport::new(A, Arc::new(provider), fast_config());
        match t.initialize() {
            Err(RmlError::InitFailed { step: failed, .. }) => assert_eq!(failed, step),
            other => panic!("{step}: expected init failure, got {other:?}"),
        }
        assert_eq!(net.live_resources(), 0, "{step}: resources leaked");
        assert!(!t.is_initialized());
        assert!(matches!(t.get_uri(), Err(RmlError::NotInitialized)));
    }
}

#[test]
fn test_initialize_is_idempotent() {
    let net = MemNetwork::new();
    let t = Transport::new(A, Arc::new(MemProvider::new(&net)), fast_config());
    assert_eq!(t.initialize().unwrap(), InitStatus::Fresh);
    let live = net.live_resources();
    assert_eq!(live, 5);
    let uri = t.get_uri().unwrap();
    assert_eq!(t.initialize().unwrap(), InitStatus::AlreadyInitialized);
    assert_eq!(net.live_resources(), live);
    assert_eq!(t.get_uri().unwrap(), uri);
}

#[test]
fn test_finalize_closes_in_reverse_order() {
    let net = MemNetwork::new();
    let t = Transport::new(A, Arc::new(MemProvider::new(&net)), fast_config());
    t.initialize().unwrap();
    net.clear_close_log();
    t.finalize().unwrap();
    assert_eq!(
        net.close_log(),
        vec![
            ResourceKind::Endpoint,
            ResourceKind::AddressVector,
            ResourceKind::CompletionQueue,
            ResourceKind::Domain,
            ResourceKind::Fabric,
        ]
    );
    assert_eq!(net.live_resources(), 0);
    // a second finalize has nothing left to do
    t.finalize().unwrap();
}

#[test]
fn test_operations_require_initialization() {
    let net = MemNetwork::new();
    let t = Transport::new(A, Arc::new(MemProvider::new(&net)), fast_config());
    let (_, cb) = send_log();
    let (_, rcb) = recv_log();
    let errors = [
        t.send(B, &[b"x"], 1, cb()).unwrap_err(),
        t.receive(PeerMatch::Any, 1, false, rcb).unwrap_err(),
        t.progress().unwrap_err(),
        t.get_uri().unwrap_err(),
        t.purge(B).unwrap_err(),
        t.add_exception(Arc::new(Recorder::default())).unwrap_err(),
    ];
    for e in errors {
        assert!(matches!(e, RmlError::NotInitialized), "got {e:?}");
        assert!(e.is_usage());
    }
    t.finalize().unwrap();
}

#[test]
fn test_excluded_provider_is_never_selected() {
    let net = MemNetwork::new();
    let mut config = fast_config();
    config.provider_exclude = vec!["mem".into()];
    let t = Transport::new(A, Arc::new(MemProvider::new(&net)), config);
    assert!(matches!(
        t.initialize(),
        Err(RmlError::InitFailed {
            step: InitStep::SelectProvider,
            ..
        })
    ));
    assert_eq!(net.live_resources(), 0);
}

#[test]
fn test_included_provider_wins_over_discovery_order() {
    let net = MemNetwork::new();
    let provider = MemProvider::with_config(
        &net,
        MemProviderConfig {
            infos: vec![MemProviderConfig::info("first"), MemProviderConfig::info("second")],
            ..MemProviderConfig::default()
        },
    );
    let mut config = fast_config();
    config.provider_include = vec!["second".into()];
    let t = Transport::new(A, Arc::new(provider), config);
    t.initialize().unwrap();
    assert_eq!(t.provider_info().unwrap().provider_name, "second");
}

#[test]
fn test_exported_address_round_trips_through_uri() {
    let p = unconnected_pair(fast_config());
    let uri = p.b.get_uri().unwrap();
    assert_eq!(p.a.set_uri(&uri).unwrap(), B);
    assert!(matches!(p.a.set_uri("not a uri"), Err(RmlError::InvalidUri(_))));

    let (log, rcb) = recv_log();
    p.b.receive(PeerMatch::Any, 1, false, rcb).unwrap();
    let (_, cb) = send_log();
    p.a.send(B, &[b"hi"], 1, cb()).unwrap();
    assert!(drive_until(&[&p.a, &p.b], Duration::from_secs(2), || len_of(&log) == 1));
}
