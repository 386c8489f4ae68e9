//! Fixture lifecycle integration tests against the in-memory DUT.

use std::sync::Arc;
use std::time::Duration;

use flowtest_harness::ops::do_barrier;
use flowtest_harness::{
    init_logging, run_test, Fixture, FixtureState, HarnessConfig, TestContext,
};
use flowtest_proto::MessageBody;
use flowtest_sim::FakeSwitch;

/// Millisecond-scale timeouts so failure paths resolve quickly.
fn fast_config() -> HarnessConfig {
    let mut config = HarnessConfig::default();
    config.default_timeout = Duration::from_millis(200);
    config.handshake_timeout = Duration::from_millis(400);
    config.retry_interval = Duration::from_millis(10);
    config.port_map.insert(1, "veth1".into());
    config.port_map.insert(2, "veth2".into());
    config
}

fn context(switch: &FakeSwitch) -> TestContext {
    init_logging();
    TestContext::new(fast_config(), Arc::new(switch.clone()))
}

#[test]
fn control_only_setup_reaches_ready() {
    let switch = FakeSwitch::new(&[1, 2]);
    let ctx = context(&switch);
    let mut fixture = Fixture::builder().control_plane().build("control_only");

    fixture.set_up(&ctx).unwrap();
    assert_eq!(fixture.state(), FixtureState::Ready);
    assert!(fixture.owns_control());
    assert_eq!(fixture.negotiated_version(), Some(1));
    assert!(fixture.supported_actions().is_some());
    assert!(fixture.data().is_none());

    // One greeting, one handshake, and the DUT's echo probe was answered
    // because keep-alive is enabled before the handshake completes.
    assert_eq!(switch.hellos_seen(), 1);
    assert_eq!(switch.features_requests(), 1);
    assert_eq!(switch.echo_replies_seen(), 1);

    fixture.tear_down().unwrap();
    assert_eq!(fixture.state(), FixtureState::TornDown);
}

#[test]
fn tear_down_is_idempotent() {
    let switch = FakeSwitch::new(&[1]);
    let ctx = context(&switch);
    let mut fixture = Fixture::builder().control_plane().build("idempotent_teardown");

    fixture.set_up(&ctx).unwrap();
    fixture.tear_down().unwrap();
    fixture.tear_down().unwrap();
    assert_eq!(fixture.state(), FixtureState::TornDown);
}

#[test]
fn inherit_setup_shares_sessions_without_second_handshake() {
    let switch = FakeSwitch::new(&[1, 2]);
    let ctx = context(&switch);

    let mut parent = Fixture::builder().control_plane().data_plane().build("parent");
    parent.set_up(&ctx).unwrap();
    assert_eq!(switch.features_requests(), 1);

    let mut child = Fixture::builder().control_plane().data_plane().build("child");
    child.inherit_setup(&parent).unwrap();
    assert_eq!(child.state(), FixtureState::Ready);
    assert!(!child.owns_control());
    assert_eq!(child.negotiated_version(), parent.negotiated_version());
    assert_eq!(child.supported_actions(), parent.supported_actions());
    // Inheritance performs no handshake of its own.
    assert_eq!(switch.features_requests(), 1);
    assert_eq!(switch.hellos_seen(), 1);

    // Child teardown must not release the parent's sessions.
    child.tear_down().unwrap();
    let control = parent.control().expect("parent still owns its session");
    assert!(control.active());
    do_barrier(control, ctx.config.default_timeout).unwrap();

    parent.tear_down().unwrap();
}

#[test]
fn inherit_setup_requires_a_ready_parent() {
    let switch = FakeSwitch::new(&[1]);
    let _ctx = context(&switch);
    let parent = Fixture::builder().control_plane().build("unready_parent");
    let mut child = Fixture::builder().control_plane().build("child");

    let err = child.inherit_setup(&parent).unwrap_err();
    assert!(err.is_setup());
}

#[test]
fn muted_handshake_is_a_setup_failure() {
    let switch = FakeSwitch::new(&[1]);
    switch.set_mute_features(true);
    let ctx = context(&switch);
    let mut fixture = Fixture::builder().control_plane().build("muted_handshake");

    let err = fixture.set_up(&ctx).unwrap_err();
    assert!(err.is_setup());
    assert!(err.to_string().contains("features"));
    assert_eq!(fixture.state(), FixtureState::Failed);
    // The partially created session was force-terminated, not left behind.
    assert!(fixture.control().is_none());

    // Teardown after a failed setup must not raise.
    fixture.tear_down().unwrap();
}

#[test]
fn refused_connect_is_a_setup_failure() {
    let switch = FakeSwitch::new(&[1]);
    switch.set_refuse_connect(true);
    let ctx = context(&switch);
    let mut fixture = Fixture::builder().control_plane().build("refused_connect");

    let err = fixture.set_up(&ctx).unwrap_err();
    assert!(err.is_setup());
    assert_eq!(fixture.state(), FixtureState::Failed);
    assert!(fixture.control().is_none());
}

#[test]
fn missing_peer_address_is_a_setup_failure() {
    let switch = FakeSwitch::new(&[1]);
    switch.set_withhold_peer_addr(true);
    let ctx = context(&switch);
    let mut fixture = Fixture::builder().control_plane().build("no_peer_addr");

    let err = fixture.set_up(&ctx).unwrap_err();
    assert!(err.is_setup());
    assert_eq!(fixture.state(), FixtureState::Failed);
}

#[test]
fn secure_variant_uses_the_encrypted_path() {
    let switch = FakeSwitch::new(&[1]);
    init_logging();
    let mut config = fast_config();
    config.tls_key = Some("key.pem".into());
    config.tls_cert = Some("cert.pem".into());
    config.tls_trust_anchors = Some("ca.pem".into());
    let ctx = TestContext::new(config, Arc::new(switch.clone()));

    let mut fixture = Fixture::builder().secure().build("secure");
    fixture.set_up(&ctx).unwrap();
    assert_eq!(fixture.state(), FixtureState::Ready);
    assert_eq!(switch.secure_connects(), 1);
    // Handshake after the secure connect is the same as the plain one.
    assert_eq!(fixture.negotiated_version(), Some(1));
    fixture.tear_down().unwrap();
}

#[test]
fn secure_variant_without_tls_material_fails_setup() {
    let switch = FakeSwitch::new(&[1]);
    let ctx = context(&switch);
    let mut fixture = Fixture::builder().secure().build("secure_no_tls");

    let err = fixture.set_up(&ctx).unwrap_err();
    assert!(err.is_setup());
    assert!(err.to_string().contains("tls"));
    assert_eq!(switch.secure_connects(), 0);
}

#[test]
fn multi_session_variant_defers_the_handshake_to_the_test_body() {
    let switch = FakeSwitch::new(&[1]);
    let ctx = context(&switch);
    let mut fixture = Fixture::builder()
        .multi_session()
        .clean_shutdown(false)
        .build("handshake_controlled");

    // Setup creates no sessions and sends nothing.
    fixture.set_up(&ctx).unwrap();
    assert_eq!(fixture.state(), FixtureState::Ready);
    assert!(fixture.sessions().is_empty());
    assert_eq!(switch.hellos_seen(), 0);

    // Sessions connect with the greeting suppressed; the body decides when
    // (and whether) to greet.
    let first = fixture.add_control_session(&ctx).unwrap();
    assert_eq!(switch.hellos_seen(), 0);
    first.send(MessageBody::Hello { version: 1 }).unwrap();
    assert_eq!(switch.hellos_seen(), 1);

    let _second = fixture.add_control_session(&ctx).unwrap();
    assert_eq!(fixture.sessions().len(), 2);
    assert_eq!(switch.hellos_seen(), 1);

    // clean_shutdown(false) force-terminates the deliberately broken
    // sessions instead of waiting on them.
    fixture.tear_down().unwrap();
    assert_eq!(fixture.state(), FixtureState::TornDown);
}

#[test]
fn add_control_session_requires_the_multi_session_capability() {
    let switch = FakeSwitch::new(&[1]);
    let ctx = context(&switch);
    let mut fixture = Fixture::builder().control_plane().build("not_multi");
    fixture.set_up(&ctx).unwrap();

    let err = fixture.add_control_session(&ctx).unwrap_err();
    assert!(err.is_setup());
    fixture.tear_down().unwrap();
}

#[test]
fn data_only_fixture_captures_to_file_when_configured() {
    let switch = FakeSwitch::new(&[1, 2]);
    init_logging();
    let capture_dir = std::env::temp_dir().join(format!("flowtest_it_{}", std::process::id()));
    let mut config = fast_config();
    config.capture_directory = Some(capture_dir.clone());
    let ctx = TestContext::new(config, Arc::new(switch.clone()));

    let mut fixture = Fixture::builder().data_plane().build("data_only");
    fixture.set_up(&ctx).unwrap();
    assert_eq!(fixture.state(), FixtureState::Ready);
    assert!(fixture.control().is_none(), "no control handshake in this variant");

    let data = fixture.data().expect("data session established");
    assert!(data.capture_active());
    let path = data.capture_path().expect("capture path set");
    assert_eq!(path, capture_dir.join("data_only.pcap"));
    assert!(path.exists());

    fixture.tear_down().unwrap();
    assert!(path.exists(), "capture file survives teardown");
    let _ = std::fs::remove_dir_all(&capture_dir);
}

#[test]
fn run_test_tears_down_after_a_body_failure() {
    let switch = FakeSwitch::new(&[1]);
    let ctx = context(&switch);
    let mut fixture = Fixture::builder().control_plane().build("body_fails");

    let err = run_test(&ctx, &mut fixture, |_fixture, _ctx| {
        Err(flowtest_harness::ops::fail("deliberate"))
    })
    .unwrap_err();
    assert!(err.is_assertion());
    assert!(err.to_string().contains("deliberate"));
    assert_eq!(fixture.state(), FixtureState::TornDown);
}

#[test]
fn run_test_surfaces_setup_failure_and_still_tears_down() {
    let switch = FakeSwitch::new(&[1]);
    switch.set_refuse_connect(true);
    let ctx = context(&switch);
    let mut fixture = Fixture::builder().control_plane().build("setup_fails");

    let err = run_test(&ctx, &mut fixture, |_fixture, _ctx| {
        panic!("body must not run after a failed setup");
    })
    .unwrap_err();
    assert!(err.is_setup());
    assert_eq!(fixture.state(), FixtureState::TornDown);
}
