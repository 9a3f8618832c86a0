//! Integration tests for void_sync
//!
//! An authoring session and a runtime receiver, each with its own
//! `MemoryScene`, connected through a loopback hub. A third endpoint
//! observes everything the authoring side sends.

use std::time::{Duration, Instant};

use void_scene::{Facet, MemoryFacet, MemoryScene, NodeId, PropertyMap, SceneGraph, Transform, Value, ValueKind};
use void_sync::*;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Rig {
    _hub: LoopbackHub,
    authoring_ep: LoopbackEndpoint,
    runtime_ep: LoopbackEndpoint,
    observer: LoopbackEndpoint,
    authoring: MemoryScene,
    runtime: MemoryScene,
    session: SyncSession,
    receiver: Receiver,
    start: Instant,
}

impl Rig {
    /// Both scenes are built by the same closure, so they start identical
    fn new(config: SyncConfig, build: impl Fn(&mut MemoryScene)) -> Self {
        init_logging();
        let hub = LoopbackHub::new();
        let mut authoring = MemoryScene::new("Main");
        let mut runtime = MemoryScene::new("Main");
        build(&mut authoring);
        build(&mut runtime);

        let session_name = config.session.clone();
        let mut session = SyncSession::new(config).unwrap();
        session.start(&mut authoring);
        let mut receiver = Receiver::new(session_name, HandlerChain::default());
        receiver.warm(&runtime);

        Self {
            authoring_ep: hub.connect(),
            runtime_ep: hub.connect(),
            observer: hub.connect(),
            _hub: hub,
            authoring,
            runtime,
            session,
            receiver,
            start: Instant::now(),
        }
    }

    fn tick(&mut self, at_ms: u64) -> TickReport {
        let now = self.start + Duration::from_millis(at_ms);
        self.session.tick(&mut self.authoring, &self.authoring_ep, now)
    }

    fn event(&mut self, event: HostEvent) {
        self.session.on_event(&mut self.authoring, event);
    }

    /// Let the runtime apply what arrived, then route replies back
    fn deliver(&mut self) -> ReceiveStats {
        let stats = self.receiver.poll(&mut self.runtime, &self.runtime_ep);
        self.session.receive(&self.authoring_ep);
        stats
    }

    /// Ops the authoring side has sent since the last call
    fn observed(&self) -> Vec<ChangeOp> {
        let authoring = self.authoring_ep.local_id();
        self.observer
            .drain()
            .into_iter()
            .filter(|e| e.sender == authoring)
            .filter_map(|e| match decode(&e.call).ok()?.message {
                WireMessage::Op(op) => Some(op),
                WireMessage::Ack(_) => None,
            })
            .collect()
    }

    fn node(&self, path: &str) -> NodeId {
        self.authoring.find_by_path(path).unwrap()
    }
}

fn root_and_cube(scene: &mut MemoryScene) {
    let root = scene.create_node("Root", None, None).unwrap();
    scene.create_node("Cube", Some(root), None).unwrap();
}

fn light() -> MemoryFacet {
    MemoryFacet::new("Light").with_property("intensity", ValueKind::Float, 1.0)
}

fn material() -> MemoryFacet {
    MemoryFacet::new("Material").with_property("color", ValueKind::Color, Value::Color([1.0, 0.0, 0.0, 1.0]))
}

fn event_driven() -> SyncConfig {
    let mut config = SyncConfig::default();
    config.scan_nodes_on_tick = false;
    config
}

fn transforms(ops: &[ChangeOp]) -> Vec<(&str, Transform)> {
    ops.iter()
        .filter_map(|op| match op {
            ChangeOp::UpdateTransform { path, transform } => Some((path.as_str(), *transform)),
            _ => None,
        })
        .collect()
}

#[test]
fn test_created_node_replicates() {
    let mut rig = Rig::new(SyncConfig::default(), |scene| {
        scene.create_node("Root", None, None).unwrap();
    });
    let root = rig.node("Root");
    rig.authoring.create_node("Cube", Some(root), None).unwrap();

    rig.tick(0);
    let ops = rig.observed();
    let creates: Vec<&ChangeOp> = ops
        .iter()
        .filter(|op| matches!(op, ChangeOp::CreateNode { .. }))
        .collect();
    assert_eq!(creates.len(), 1);
    let ChangeOp::CreateNode { path, transform, .. } = creates[0] else {
        unreachable!()
    };
    assert_eq!(path, "Root/Cube");
    assert_eq!(transform.position, [0.0, 0.0, 0.0]);

    rig.deliver();
    let cube = rig.runtime.find_by_path("Root/Cube").unwrap();
    assert_eq!(rig.runtime.transform(cube).unwrap().position, [0.0, 0.0, 0.0]);
}

#[test]
fn test_rename_while_transform_queued() {
    let mut rig = Rig::new(SyncConfig::default(), root_and_cube);
    let cube = rig.node("Root/Cube");

    rig.authoring.set_transform(cube, Transform::from_position([1.0, 0.0, 0.0])).unwrap();
    rig.tick(0);
    rig.observed();

    // rate limited: this one stays queued
    rig.authoring.set_transform(cube, Transform::from_position([2.0, 0.0, 0.0])).unwrap();
    rig.tick(10);
    rig.authoring.set_name(cube, "Box").unwrap();
    rig.tick(20);
    let ops = rig.observed();
    let renames: Vec<&ChangeOp> = ops
        .iter()
        .filter(|op| matches!(op, ChangeOp::RenameNode { .. }))
        .collect();
    assert_eq!(
        renames,
        vec![&ChangeOp::RenameNode {
            path: "Root/Cube".into(),
            new_name: "Box".into(),
        }]
    );
    assert!(transforms(&ops).is_empty());

    rig.tick(80);
    let ops = rig.observed();
    assert_eq!(transforms(&ops), vec![("Root/Box", Transform::from_position([2.0, 0.0, 0.0]))]);

    rig.deliver();
    let boxed = rig.runtime.find_by_path("Root/Box").unwrap();
    assert_eq!(rig.runtime.transform(boxed).unwrap().position, [2.0, 0.0, 0.0]);
    assert!(rig.runtime.find_by_path("Root/Cube").is_none());
}

#[test]
fn test_facet_edits_within_window_coalesce() {
    let mut rig = Rig::new(event_driven(), |scene| {
        root_and_cube(scene);
        let cube = scene.find_by_path("Root/Cube").unwrap();
        scene.attach_facet(cube, light()).unwrap();
    });
    let cube = rig.node("Root/Cube");

    for intensity in [2.0, 3.0] {
        rig.authoring
            .facet_mut(cube, 0)
            .unwrap()
            .set("intensity", Value::Float(intensity))
            .unwrap();
        rig.event(HostEvent::NodeChanged(cube));
    }
    rig.tick(10);

    let updates: Vec<ChangeOp> = rig
        .observed()
        .into_iter()
        .filter(|op| matches!(op, ChangeOp::UpdateFacetProperties { .. }))
        .collect();
    assert_eq!(updates.len(), 1);
    let ChangeOp::UpdateFacetProperties { properties, signature, .. } = &updates[0] else {
        unreachable!()
    };
    assert_eq!(signature.to_string(), "Light#0");
    assert_eq!(properties.len(), 1);
    assert_eq!(properties.get("intensity"), Some(&Value::Float(3.0)));

    rig.deliver();
    let runtime_cube = rig.runtime.find_by_path("Root/Cube").unwrap();
    assert_eq!(
        rig.runtime.facet(runtime_cube, 0).unwrap().get("intensity"),
        Some(Value::Float(3.0))
    );
}

#[test]
fn test_delete_drops_pending_changes() {
    let mut rig = Rig::new(event_driven(), root_and_cube);
    let cube = rig.node("Root/Cube");

    for x in [1.0, 2.0] {
        rig.authoring.set_transform(cube, Transform::from_position([x, 0.0, 0.0])).unwrap();
        rig.event(HostEvent::NodeChanged(cube));
    }
    rig.authoring.set_tag(cube, "Enemy").unwrap();
    rig.event(HostEvent::NodeChanged(cube));
    assert!(rig.session.buffer().pending(cube).is_some());

    rig.authoring.destroy_node(cube).unwrap();
    rig.event(HostEvent::NodeDestroyed(cube));
    assert!(rig.session.buffer().pending(cube).is_none());

    rig.tick(0);
    assert_eq!(
        rig.observed(),
        vec![ChangeOp::DeleteNode {
            path: "Root/Cube".into()
        }]
    );

    rig.deliver();
    assert!(rig.runtime.find_by_path("Root/Cube").is_none());
    assert!(rig.runtime.find_by_path("Root").is_some());
}

#[test]
fn test_transform_burst_sends_latest() {
    let mut rig = Rig::new(event_driven(), root_and_cube);
    let cube = rig.node("Root/Cube");

    for x in [1.0, 2.0, 3.0] {
        rig.authoring.set_transform(cube, Transform::from_position([x, 0.0, 0.0])).unwrap();
        rig.event(HostEvent::NodeChanged(cube));
    }
    rig.tick(0);

    let ops = rig.observed();
    assert_eq!(transforms(&ops), vec![("Root/Cube", Transform::from_position([3.0, 0.0, 0.0]))]);
}

#[test]
fn test_transform_rate_limited_per_interval() {
    let mut rig = Rig::new(SyncConfig::default().with_transform_interval_ms(75), root_and_cube);
    let cube = rig.node("Root/Cube");

    rig.authoring.set_transform(cube, Transform::from_position([1.0, 0.0, 0.0])).unwrap();
    rig.tick(0);
    assert_eq!(transforms(&rig.observed()).len(), 1);

    rig.authoring.set_transform(cube, Transform::from_position([2.0, 0.0, 0.0])).unwrap();
    rig.tick(30);
    rig.tick(60);
    assert!(transforms(&rig.observed()).is_empty());

    rig.tick(75);
    assert_eq!(
        transforms(&rig.observed()),
        vec![("Root/Cube", Transform::from_position([2.0, 0.0, 0.0]))]
    );
}

#[test]
fn test_interval_is_clamped() {
    let config = SyncConfig::from_toml_str("transform_interval_ms = 5\nsession = \"edit\"").unwrap();
    assert_eq!(config.transform_interval(), Duration::from_millis(20));
    assert_eq!(config.session, "edit");
}

#[test]
fn test_own_broadcast_never_applied() {
    let mut rig = Rig::new(SyncConfig::default(), root_and_cube);
    let cube = rig.node("Root/Cube");
    rig.authoring.set_active(cube, false).unwrap();
    rig.tick(0);

    // a receiver on the authoring endpoint sees only its own calls
    let mut echo = Receiver::new("default", HandlerChain::default());
    let mut copy = rig.authoring.clone();
    copy.set_active(cube, true).unwrap();
    let before = copy.serialize_state(cube).unwrap();
    let stats = echo.poll(&mut copy, &rig.authoring_ep);

    assert!(stats.received > 0);
    assert_eq!(stats.echoes, stats.received);
    assert_eq!(stats.applied, 0);
    assert_eq!(copy.serialize_state(cube).unwrap(), before);
}

#[test]
fn test_reparent_replicates() {
    let mut rig = Rig::new(SyncConfig::default(), |scene| {
        root_and_cube(scene);
        scene.create_node("Shelf", None, None).unwrap();
    });
    let cube = rig.node("Root/Cube");
    let shelf = rig.node("Shelf");
    rig.authoring.set_parent(cube, Some(shelf)).unwrap();

    rig.tick(0);
    let ops = rig.observed();
    assert!(ops.contains(&ChangeOp::ReparentNode {
        path: "Root/Cube".into(),
        new_parent_path: Some("Shelf".into()),
    }));

    rig.deliver();
    assert!(rig.runtime.find_by_path("Shelf/Cube").is_some());
    assert!(rig.runtime.find_by_path("Root/Cube").is_none());
}

#[test]
fn test_full_state_round_trip_is_quiet() {
    let mut scene = MemoryScene::new("Main");
    root_and_cube(&mut scene);
    let cube = scene.find_by_path("Root/Cube").unwrap();
    scene.attach_facet(cube, light()).unwrap();

    let chain = HandlerChain::default();
    let mut tracker = EntityTracker::new(SyncConfig::default().tolerance());
    let mut buffer = PendingChangeBuffer::new(Duration::from_millis(75));
    tracker.capture_all(&scene, &chain);

    let state = scene.serialize_state(cube).unwrap();
    scene.restore_state(cube, &state).unwrap();
    assert_eq!(tracker.scan(&scene, &chain, &mut buffer), 0);
    assert!(buffer.is_empty());
}

#[test]
fn test_sub_tolerance_drift_sends_nothing() {
    let mut rig = Rig::new(SyncConfig::default(), root_and_cube);
    let cube = rig.node("Root/Cube");
    rig.authoring
        .set_transform(cube, Transform::from_position([0.00001, 0.0, 0.0]))
        .unwrap();

    rig.tick(0);
    rig.tick(100);
    assert!(rig.observed().is_empty());
    assert_eq!(rig.session.metrics().total().count, 0);
}

#[test]
fn test_patch_applied_twice_matches_once() {
    let mut once = MemoryScene::new("Main");
    root_and_cube(&mut once);
    let mut twice = once.clone();

    let mut properties = PropertyMap::new();
    properties.insert("tag".into(), Value::from("Pickup"));
    properties.insert("layer".into(), Value::Int(4));
    let patch = ChangeOp::PatchNodeProperties {
        path: "Root/Cube".into(),
        properties,
    };

    let mut applier = Applier::new(HandlerChain::default());
    applier.apply(&mut once, &patch);
    let mut applier = Applier::new(HandlerChain::default());
    applier.apply(&mut twice, &patch);
    applier.apply(&mut twice, &patch);

    let cube = once.find_by_path("Root/Cube").unwrap();
    assert_eq!(once.serialize_state(cube).unwrap(), twice.serialize_state(cube).unwrap());
}

fn crate_with_material(scene: &mut MemoryScene) {
    let node = scene.create_node("Crate", None, None).unwrap();
    let mat = scene.create_resource(material(), None);
    scene.assign_resource(node, 0, Some(mat)).unwrap();
}

#[test]
fn test_registration_acknowledged_once() {
    let mut rig = Rig::new(SyncConfig::default(), crate_with_material);
    let ids = rig.session.registry().resource_ids();
    assert_eq!(ids.len(), 1);

    rig.tick(0);
    let registers = rig
        .observed()
        .into_iter()
        .filter(|op| matches!(op, ChangeOp::RegisterIdentity { .. }))
        .count();
    assert_eq!(registers, 1);

    let stats = rig.deliver();
    assert_eq!(stats.acks_sent, 1);
    assert!(rig.session.registry().is_acknowledged(&ids[0]));
    assert!(rig.receiver.applier().identity(&ids[0]).is_some());

    rig.tick(50);
    assert!(rig.observed().is_empty());
}

#[test]
fn test_registration_retried_until_acknowledged() {
    let mut rig = Rig::new(SyncConfig::default(), crate_with_material);

    for at in [0, 50, 100] {
        rig.tick(at);
        let registers = rig
            .observed()
            .into_iter()
            .filter(|op| matches!(op, ChangeOp::RegisterIdentity { .. }))
            .count();
        assert_eq!(registers, 1, "tick at {}ms", at);
    }

    rig.deliver();
    rig.tick(150);
    assert!(rig.observed().is_empty());
}

#[test]
fn test_shared_resource_edit_reaches_runtime() {
    let mut rig = Rig::new(SyncConfig::default(), crate_with_material);
    rig.tick(0);
    rig.deliver();
    rig.observed();

    let id = rig.session.registry().resource_ids().remove(0);
    let handle = rig.session.registry().resolve(&rig.authoring, &id).unwrap();
    rig.authoring
        .resource_mut(handle)
        .unwrap()
        .set("color", Value::Color([0.0, 0.0, 1.0, 1.0]))
        .unwrap();

    // not yet due for a poll
    rig.tick(100);
    assert!(rig.observed().is_empty());

    rig.tick(300);
    let ops = rig.observed();
    assert!(matches!(
        ops.as_slice(),
        [ChangeOp::UpdateIdentityProperties { resource_id, .. }] if *resource_id == id
    ));

    rig.deliver();
    let runtime_crate = rig.runtime.find_by_path("Crate").unwrap();
    let runtime_mat = rig.runtime.resource_slots(runtime_crate)[0].unwrap();
    assert_eq!(
        rig.runtime.resource(runtime_mat).unwrap().get("color"),
        Some(Value::Color([0.0, 0.0, 1.0, 1.0]))
    );
}

#[test]
fn test_replaced_resource_tracked_again() {
    let mut rig = Rig::new(SyncConfig::default(), crate_with_material);
    rig.tick(0);
    rig.deliver();
    rig.observed();
    let id = rig.session.registry().resource_ids().remove(0);
    assert!(rig.session.registry().is_acknowledged(&id));

    let node = rig.node("Crate");
    let old = rig.authoring.resource_slots(node)[0].unwrap();
    rig.authoring.destroy_resource(old);
    let replacement = rig.authoring.create_resource(material(), None);
    rig.authoring.assign_resource(node, 0, Some(replacement)).unwrap();
    rig.authoring
        .resource_mut(replacement)
        .unwrap()
        .set("color", Value::Color([0.0, 1.0, 0.0, 1.0]))
        .unwrap();

    let mut ops = Vec::new();
    for step in 1..=8 {
        rig.tick(step * 300);
        ops.extend(rig.observed());
    }
    assert!(ops
        .iter()
        .any(|op| matches!(op, ChangeOp::RegisterIdentity { resource_id, .. } if *resource_id == id)));
    let update = ops
        .iter()
        .find_map(|op| match op {
            ChangeOp::UpdateIdentityProperties { resource_id, properties } if *resource_id == id => Some(properties),
            _ => None,
        })
        .unwrap();
    assert_eq!(update.get("color"), Some(&Value::Color([0.0, 1.0, 0.0, 1.0])));

    rig.deliver();
    assert!(rig.session.registry().is_acknowledged(&id));
    let runtime_crate = rig.runtime.find_by_path("Crate").unwrap();
    let runtime_mat = rig.runtime.resource_slots(runtime_crate)[0].unwrap();
    assert_eq!(
        rig.runtime.resource(runtime_mat).unwrap().get("color"),
        Some(Value::Color([0.0, 1.0, 0.0, 1.0]))
    );
}

#[test]
fn test_unacknowledged_registration_does_not_starve_edits() {
    // nobody ever answers the registration
    let mut rig = Rig::new(SyncConfig::default(), crate_with_material);
    for frame in 0..600u64 {
        rig.tick(frame * 16);
    }
    assert!(rig.session.metrics().peak_backlog <= 1);
    rig.observed();

    let node = rig.node("Crate");
    rig.authoring
        .set_transform(node, Transform::from_position([2.0, 0.0, 0.0]))
        .unwrap();
    let mut sent_at = None;
    for frame in 600..700u64 {
        rig.tick(frame * 16);
        if !transforms(&rig.observed()).is_empty() {
            sent_at = Some(frame);
            break;
        }
    }
    // within about one budget window
    assert!(matches!(sent_at, Some(frame) if frame < 670), "sent at {:?}", sent_at);
    assert!(rig.session.metrics().peak_backlog <= 2);
}

#[test]
fn test_identity_survives_owner_rename() {
    let mut rig = Rig::new(SyncConfig::default(), crate_with_material);
    rig.tick(0);
    rig.deliver();

    let node = rig.node("Crate");
    rig.authoring.set_name(node, "Barrel").unwrap();
    rig.tick(100);
    rig.deliver();
    assert!(rig.runtime.find_by_path("Barrel").is_some());

    let id = rig.session.registry().resource_ids().remove(0);
    assert!(rig.session.registry().is_acknowledged(&id));
    assert_eq!(rig.session.registry().resolve(&rig.authoring, &id), rig.authoring.resource_slots(node)[0]);
}

#[test]
fn test_duplicated_anchor_regenerated() {
    let mut rig = Rig::new(SyncConfig::default(), crate_with_material);
    let original = rig.node("Crate");
    let anchor = rig.authoring.anchor(original).unwrap();

    let copy = rig.authoring.duplicate_node(original).unwrap();
    assert_eq!(rig.authoring.anchor(copy), Some(anchor));
    rig.tick(0);

    assert_eq!(rig.authoring.anchor(original), Some(anchor));
    let regenerated = rig.authoring.anchor(copy).unwrap();
    assert_ne!(regenerated, anchor);
    assert_eq!(rig.session.registry().resource_ids().len(), 2);
}

#[test]
fn test_dry_run_measures_without_sending() {
    let mut rig = Rig::new(SyncConfig::default().with_dry_run(true), |scene| {
        scene.create_node("Root", None, None).unwrap();
    });
    let root = rig.node("Root");
    rig.authoring.create_node("Cube", Some(root), None).unwrap();

    let report = rig.tick(0);
    assert!(report.ops > 0);
    assert_eq!(report.sent, 0);
    assert!(rig.observed().is_empty());

    let create = rig.session.metrics().call("CreateNode").unwrap();
    assert_eq!(create.count, 1);
    assert!(create.bytes > 0);
}

#[test]
fn test_journal_replay_reproduces_session() {
    let mut rig = Rig::new(SyncConfig::default(), root_and_cube);
    let mut persistent = rig.authoring.clone();
    let cube = rig.node("Root/Cube");

    rig.authoring.set_transform(cube, Transform::from_position([0.0, 5.0, 0.0])).unwrap();
    rig.authoring.set_name(cube, "Box").unwrap();
    rig.tick(0);
    rig.authoring.set_tag(cube, "Crate").unwrap();
    rig.tick(100);

    let journal = rig.session.stop().unwrap();
    assert!(rig.session.stop().is_none());
    let report = journal.replay(Some(&mut persistent), HandlerChain::default()).unwrap();
    assert_eq!(report.skipped, 0);

    let boxed = persistent.find_by_path("Root/Box").unwrap();
    assert_eq!(persistent.transform(boxed).unwrap().position, [0.0, 5.0, 0.0]);
    assert_eq!(persistent.info(boxed).unwrap().tag, "Crate");

    assert_eq!(persistent.undo_depth(), 1);
    persistent.undo();
    assert!(persistent.find_by_path("Root/Cube").is_some());
    assert!(persistent.find_by_path("Root/Box").is_none());
}

#[test]
fn test_replay_fails_fast_when_unloaded() {
    let mut rig = Rig::new(SyncConfig::default(), root_and_cube);
    let mut persistent = rig.authoring.clone();
    let cube = rig.node("Root/Cube");
    rig.authoring.set_active(cube, false).unwrap();
    rig.tick(0);
    let journal = rig.session.stop().unwrap();

    persistent.set_loaded(false);
    let err = journal.replay(Some(&mut persistent), HandlerChain::default()).unwrap_err();
    assert!(matches!(err, SyncError::ReplayPrecondition(_)));
    assert_eq!(persistent.undo_depth(), 0);
    let untouched = persistent.find_by_path("Root/Cube").unwrap();
    assert!(persistent.info(untouched).unwrap().active);
}
