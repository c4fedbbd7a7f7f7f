// Public-API integration tests for the common time service.
// These exercise the server core through the clock and config facets the
// way an embedding process would, without needing a privileged network
// setup.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use common_time::clock::{LocalClock, SystemLocalClock};
use common_time::server::{CommonTimeServer, Role, ServerConfig};
use common_time::service::{ClockService, ConfigService, TimelineListener};

fn unbound_server() -> Arc<CommonTimeServer> {
    let config = ServerConfig {
        auto_disable: false,
        ..ServerConfig::default()
    };
    CommonTimeServer::new(Arc::new(SystemLocalClock::new()), config).unwrap()
}

struct RecordingListener {
    seen: Mutex<Vec<Option<u64>>>,
}

impl RecordingListener {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
        })
    }
}

impl TimelineListener for RecordingListener {
    fn on_timeline_changed(&self, timeline_id: Option<u64>) {
        self.seen.lock().push(timeline_id);
    }
}

#[test]
fn fresh_service_reports_no_common_time() {
    let server = unbound_server();
    let clock = ClockService::new(server.clone());

    assert_eq!(clock.is_common_time_valid(), (false, None));
    assert_eq!(clock.get_state(), Role::Initial);
    assert_eq!(clock.get_estimated_error(), None);
    assert_eq!(clock.get_master_addr(), None);
    assert!(clock.get_common_time().is_err());
    assert_eq!(clock.get_common_freq(), 1_000_000);
    assert_eq!(clock.get_local_freq(), 1_000_000_000);
    assert!(clock.get_local_time() >= 0);
}

#[test]
fn networkless_master_mode_end_to_end() {
    let server = unbound_server();
    let clock = ClockService::new(server.clone());

    let listener = RecordingListener::new();
    let dyn_listener: Arc<dyn TimelineListener> = listener.clone();
    clock.register_listener(&dyn_listener).unwrap();

    server.start().unwrap();
    server.force_networkless_master_mode().unwrap();

    let (valid, timeline) = clock.is_common_time_valid();
    assert!(valid);
    let timeline = timeline.expect("networkless master must create a timeline");
    assert_ne!(timeline, 0);

    assert_eq!(clock.get_state(), Role::Master);
    assert_eq!(clock.get_estimated_error(), Some(0));
    assert_eq!(*listener.seen.lock(), vec![Some(timeline)]);

    // Common time queries work, run forward, and invert cleanly.
    let t1 = clock.get_common_time().unwrap();
    std::thread::sleep(Duration::from_millis(5));
    let t2 = clock.get_common_time().unwrap();
    assert!(t2 >= t1);

    let local = clock.common_time_to_local_time(t2).unwrap();
    let round_trip = clock.local_time_to_common_time(local).unwrap();
    assert!((round_trip - t2).abs() <= 1);

    server.shutdown();
}

#[test]
fn networkless_master_mode_requires_no_socket() {
    let server = unbound_server();
    // No interface bound: allowed.
    server.force_networkless_master_mode().unwrap();
}

#[test]
fn worker_thread_shuts_down_cleanly() {
    let server = unbound_server();
    server.start().unwrap();
    assert!(server.start().is_err(), "second start must be rejected");
    server.shutdown();
}

#[test]
fn config_limits_are_bit_exact() {
    let server = unbound_server();
    let config = ConfigService::new(server.clone());

    // Priority: 0-127.
    assert!(config.set_master_election_priority(127).is_ok());
    assert!(config.set_master_election_priority(128).is_err());
    assert_eq!(config.get_master_election_priority(), 127);

    // Master announce interval: 500ms to 6h.
    assert!(config.set_master_announce_interval(499).is_err());
    assert!(config.set_master_announce_interval(500).is_ok());
    assert!(config.set_master_announce_interval(6 * 3_600_000).is_ok());
    assert!(config.set_master_announce_interval(6 * 3_600_000 + 1).is_err());

    // Client sync interval: 250ms to 60min.
    assert!(config.set_client_sync_interval(249).is_err());
    assert!(config.set_client_sync_interval(250).is_ok());
    assert!(config.set_client_sync_interval(3_600_000).is_ok());
    assert!(config.set_client_sync_interval(3_600_001).is_err());

    // Panic threshold: at least 1000us.
    assert!(config.set_panic_threshold(999).is_err());
    assert!(config.set_panic_threshold(1_000).is_ok());
    assert_eq!(config.get_panic_threshold(), 1_000);
}

#[test]
fn election_endpoint_must_be_broadcast_or_multicast() {
    let server = unbound_server();
    let config = ConfigService::new(server.clone());

    // Unicast is rejected.
    let unicast = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 1), 8886);
    assert!(config.set_master_election_endpoint(unicast).is_err());

    // Port zero is rejected.
    let no_port = SocketAddrV4::new(Ipv4Addr::BROADCAST, 0);
    assert!(config.set_master_election_endpoint(no_port).is_err());

    // Broadcast and multicast are accepted.
    let broadcast = SocketAddrV4::new(Ipv4Addr::BROADCAST, 8886);
    assert!(config.set_master_election_endpoint(broadcast).is_ok());
    let multicast = SocketAddrV4::new(Ipv4Addr::new(224, 0, 0, 42), 8886);
    assert!(config.set_master_election_endpoint(multicast).is_ok());
    assert_eq!(config.get_master_election_endpoint(), multicast);
}

#[test]
fn invalid_startup_config_is_rejected() {
    let bad_priority = ServerConfig {
        master_priority: 200,
        ..ServerConfig::default()
    };
    assert!(CommonTimeServer::new(Arc::new(SystemLocalClock::new()), bad_priority).is_err());

    let bad_endpoint = ServerConfig {
        election_endpoint: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 8886),
        ..ServerConfig::default()
    };
    assert!(CommonTimeServer::new(Arc::new(SystemLocalClock::new()), bad_endpoint).is_err());

    let bad_interval = ServerConfig {
        client_sync_interval_ms: 1,
        ..ServerConfig::default()
    };
    assert!(CommonTimeServer::new(Arc::new(SystemLocalClock::new()), bad_interval).is_err());
}

#[test]
fn interface_binding_round_trips_and_empty_means_unbound() {
    let server = unbound_server();
    let config = ConfigService::new(server.clone());

    assert_eq!(config.get_interface_binding(), None);
    config
        .set_interface_binding(Some("eth0".to_string()))
        .unwrap();
    assert_eq!(config.get_interface_binding(), Some("eth0".to_string()));
    config.set_interface_binding(Some(String::new())).unwrap();
    assert_eq!(config.get_interface_binding(), None);
}

#[test]
fn listener_registration_lifecycle() {
    let server = unbound_server();
    let clock = ClockService::new(server.clone());

    let listener = RecordingListener::new();
    let dyn_listener: Arc<dyn TimelineListener> = listener.clone();

    clock.register_listener(&dyn_listener).unwrap();
    assert!(clock.register_listener(&dyn_listener).is_err());
    assert_eq!(clock.active_listeners(), 1);

    clock.unregister_listener(&dyn_listener).unwrap();
    assert!(clock.unregister_listener(&dyn_listener).is_err());
    assert_eq!(clock.active_listeners(), 0);

    // A listener whose peer vanishes is dropped without explicit
    // unregistration.
    let short_lived = RecordingListener::new();
    let dyn_short: Arc<dyn TimelineListener> = short_lived.clone();
    clock.register_listener(&dyn_short).unwrap();
    drop(dyn_short);
    drop(short_lived);
    assert_eq!(clock.active_listeners(), 0);
}

#[test]
fn status_dumps_render() {
    let server = unbound_server();
    server.force_networkless_master_mode().unwrap();

    let mut clock_dump = Vec::new();
    server.dump_clock_status(&mut clock_dump, 2).unwrap();
    let text = String::from_utf8(clock_dump).unwrap();
    assert!(text.contains("Common Clock Service Status"));
    assert!(text.contains("State          : MASTER"));
    assert!(text.contains("Active Clients : 2"));

    let mut config_dump = Vec::new();
    server.dump_config_status(&mut config_dump).unwrap();
    let text = String::from_utf8(config_dump).unwrap();
    assert!(text.contains("Common Time Config Service Status"));
    assert!(text.contains("Master Election Endpoint  : 255.255.255.255:8886"));
}

#[test]
fn local_clock_facet_is_monotonic() {
    let server = unbound_server();
    let clock = ClockService::new(server);

    let mut prev = clock.get_local_time();
    for _ in 0..100 {
        let now = clock.get_local_time();
        assert!(now >= prev);
        prev = now;
    }
}

#[test]
fn estimated_error_is_zero_for_master_unknown_otherwise() {
    let server = unbound_server();
    let clock = ClockService::new(server.clone());

    assert_eq!(clock.get_estimated_error(), None);
    server.force_networkless_master_mode().unwrap();
    assert_eq!(clock.get_estimated_error(), Some(0));
}

#[test]
fn local_clock_trait_object_works_through_facade() {
    // The service accepts any LocalClock implementation.
    let clock: Arc<dyn LocalClock> = Arc::new(SystemLocalClock::new());
    let server = CommonTimeServer::new(clock, ServerConfig::default()).unwrap();
    let facet = ClockService::new(server);
    assert_eq!(facet.get_local_freq(), 1_000_000_000);
}
