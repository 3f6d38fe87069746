use opsync_agent::engine::EngineOptions;
use opsync_agent::{
    recover_from_bundle, recover_from_relay, AgentConfig, RetryPolicy, SyncEngine,
    SyncNotification, SyncOutcome, SyncReport,
};
use opsync_core::crypto::GROUP_KEY_SIZE;
use opsync_core::payload::CONSCIOUSNESS_STATE;
use opsync_core::{ConsciousnessState, DeviceId, KeyStore, ManualClock, Op, QuarantineReason, SyncError};
use opsync_proto::{BundleFormat, EventBundle};
use opsync_relay::{MemoryRelay, Relay};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const GROUP: [u8; GROUP_KEY_SIZE] = [11; GROUP_KEY_SIZE];

struct Device {
    engine: SyncEngine,
    wall: Arc<ManualClock>,
}

impl Device {
    fn new(id: u8, start_ms: u64) -> Self {
        Self::with(id, start_ms, |_| {})
    }

    fn with(id: u8, start_ms: u64, tweak: impl FnOnce(&mut EngineOptions)) -> Self {
        let keys = KeyStore::with_group_key(DeviceId::from_bytes([id; 8]), GROUP);
        Self::from_keys(keys, start_ms, tweak)
    }

    fn from_keys(keys: KeyStore, start_ms: u64, tweak: impl FnOnce(&mut EngineOptions)) -> Self {
        let wall = Arc::new(ManualClock::new(start_ms));
        let mut options = EngineOptions {
            wall: wall.clone(),
            retry: RetryPolicy {
                attempts: 3,
                base: Duration::from_millis(1),
                max: Duration::from_millis(5),
            },
            ..EngineOptions::default()
        };
        tweak(&mut options);
        Self {
            engine: SyncEngine::open_in_memory_with(keys, options).unwrap(),
            wall,
        }
    }

    fn write(&self, entity_id: &str, op: Op, payload: serde_json::Value) {
        self.wall.advance(1);
        self.engine
            .create_sync_event("memory", entity_id, op, &payload)
            .unwrap();
    }

    fn memory(&self, entity_id: &str) -> serde_json::Value {
        self.engine
            .state("memory", entity_id)
            .map(|s| s.value())
            .unwrap_or_default()
    }

    async fn sync(&self, relay: &dyn Relay) -> SyncReport {
        match self.engine.sync_with(relay).await.unwrap() {
            SyncOutcome::Completed(report) => report,
            SyncOutcome::Skipped => panic!("cycle unexpectedly skipped"),
        }
    }
}

fn values(device: &Device) -> Vec<(String, serde_json::Value)> {
    device
        .engine
        .states()
        .into_iter()
        .map(|(key, state)| (key.to_string(), state.value()))
        .collect()
}

fn pair_all(devices: &[&Device]) {
    for a in devices {
        for b in devices {
            a.engine
                .pair(b.engine.device_id(), b.engine.keys().public_key())
                .unwrap();
        }
    }
}

#[tokio::test]
async fn scenario_a_then_b_last_writer_wins() {
    let relay = MemoryRelay::new("relay");
    let a = Device::new(1, 10_000);
    let b = Device::new(2, 10_000);
    pair_all(&[&a, &b]);

    // A: create mem-1 {x:1}; empty B pulls it
    a.write("mem-1", Op::Create, json!({"x": 1}));
    a.sync(&relay).await;
    let report = b.sync(&relay).await;
    assert_eq!(report.accepted, 1);
    assert_eq!(b.memory("mem-1"), json!({"x": 1}));

    // A: later update to {x:2}
    a.wall.advance(1_000);
    a.write("mem-1", Op::Update, json!({"x": 2}));
    a.sync(&relay).await;
    let report = b.sync(&relay).await;
    assert_eq!(report.accepted, 1);
    assert_eq!(b.memory("mem-1"), json!({"x": 2}));
    assert_eq!(a.memory("mem-1"), b.memory("mem-1"));
}

async fn scenario_c(c_first: bool) -> (serde_json::Value, serde_json::Value) {
    let relay = MemoryRelay::new("relay");
    let b = Device::new(2, 20_000);
    let c = Device::new(3, 10_000);
    pair_all(&[&b, &c]);

    // C's value is older but larger
    c.engine
        .create_typed_event(
            "self",
            Op::Update,
            &ConsciousnessState {
                canonical_memories_loaded: Some(134),
                ..ConsciousnessState::default()
            },
        )
        .unwrap();
    b.engine
        .create_typed_event(
            "self",
            Op::Update,
            &ConsciousnessState {
                canonical_memories_loaded: Some(90),
                trust_level: Some(0.5),
                ..ConsciousnessState::default()
            },
        )
        .unwrap();

    let (first, second) = if c_first { (&c, &b) } else { (&b, &c) };
    first.sync(&relay).await;
    second.sync(&relay).await;
    first.sync(&relay).await;

    let value = |d: &Device| {
        d.engine
            .state(CONSCIOUSNESS_STATE, "self")
            .unwrap()
            .value()
    };
    (value(&b), value(&c))
}

#[tokio::test]
async fn scenario_c_monotonic_field_is_order_independent() {
    for c_first in [true, false] {
        let (on_b, on_c) = scenario_c(c_first).await;
        assert_eq!(on_b["canonical_memories_loaded"], json!(134));
        assert_eq!(on_b, on_c);
        assert_eq!(on_b["trust_level"], json!(0.5));
    }
}

#[tokio::test]
async fn concurrent_writers_converge() {
    let relay = MemoryRelay::new("relay");
    let devices = [
        Device::new(1, 5_000),
        Device::new(2, 5_000),
        Device::new(3, 5_003),
    ];
    pair_all(&devices.iter().collect::<Vec<_>>());

    for (n, device) in devices.iter().enumerate() {
        device.write("shared", Op::Update, json!({"writer": n}));
        device.write("own", Op::Create, json!({"writer": n}));
    }
    for _ in 0..2 {
        for device in &devices {
            device.sync(&relay).await;
        }
    }

    let states: Vec<_> = devices.iter().map(values).collect();
    assert!(states.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(relay.len(), 6);
    assert_eq!(devices[0].memory("shared")["writer"], json!(2));
}

#[tokio::test]
async fn tampered_event_taints_the_rest_of_its_chain() {
    let relay = MemoryRelay::new("relay");
    let a = Device::new(1, 1_000);
    let b = Device::new(2, 1_000);
    pair_all(&[&a, &b]);

    a.write("m1", Op::Create, json!({"n": 1}));
    a.write("m2", Op::Create, json!({"n": 2}));
    a.write("m3", Op::Create, json!({"n": 3}));
    a.sync(&relay).await;

    let second = a.engine.export_event_log().unwrap()[1].op_id;
    assert!(relay.tamper(&second, |e| e.cipher_blob.ciphertext[0] ^= 0x01));

    let mut rx = b.engine.subscribe();
    let report = b.sync(&relay).await;
    assert_eq!((report.accepted, report.quarantined), (1, 2));
    assert_eq!(b.memory("m1"), json!({"n": 1}));
    assert!(b.engine.state("memory", "m2").is_none());
    assert!(b.engine.state("memory", "m3").is_none());

    let mut reasons = Vec::new();
    while let Ok(notification) = rx.try_recv() {
        if let SyncNotification::EventQuarantined(q) = notification {
            reasons.push(q.reason);
        }
    }
    assert_eq!(
        reasons,
        vec![QuarantineReason::HashMismatch, QuarantineReason::Untrusted]
    );

    // The rejected events are pulled again and stay quarantined once
    let again = b.sync(&relay).await;
    assert_eq!(again.quarantined, 2);
    let status = b.engine.get_sync_status().unwrap();
    assert_eq!(status.quarantined_count, 2);
    assert_eq!(status.events_in_log, 1);
}

#[tokio::test]
async fn events_from_a_device_paired_later_are_pulled_again() {
    let relay = MemoryRelay::new("relay");
    let a = Device::new(1, 2_000);
    let b = Device::new(2, 2_000);
    let c = Device::new(3, 1_000);
    pair_all(&[&a, &b]);

    // C's event sorts before A's but B does not know C yet
    c.write("mem-c", Op::Create, json!({"c": 1}));
    c.sync(&relay).await;
    a.write("mem-a", Op::Create, json!({"a": 1}));
    a.sync(&relay).await;

    let report = b.sync(&relay).await;
    assert_eq!((report.accepted, report.quarantined), (1, 1));
    assert_eq!(b.memory("mem-a"), json!({"a": 1}));
    assert!(b.engine.state("memory", "mem-c").is_none());
    assert!(report.pull_watermark.is_none());

    b.engine
        .pair(c.engine.device_id(), c.engine.keys().public_key())
        .unwrap();
    c.write("mem-c", Op::Update, json!({"c": 2}));
    c.sync(&relay).await;

    let report = b.sync(&relay).await;
    assert_eq!(report.accepted, 2);
    assert_eq!(report.quarantined, 0);
    assert_eq!(b.memory("mem-c"), json!({"c": 2}));
    assert_eq!(b.engine.get_sync_status().unwrap().quarantined_count, 0);

    // Once nothing is rejected the watermark catches up
    let report = b.sync(&relay).await;
    assert_eq!((report.pulled, report.accepted), (0, 0));
}

#[tokio::test]
async fn pruning_never_breaks_a_peer_chain() {
    let relay = MemoryRelay::new("relay");
    let a = Device::with(1, 1_000, |o| {
        o.ephemeral_types = HashMap::from([("presence".to_string(), Duration::from_secs(1))]);
    });
    let b = Device::new(2, 1_000);
    pair_all(&[&a, &b]);

    a.write("mem-1", Op::Create, json!({"x": 1}));
    a.sync(&relay).await;
    a.engine
        .create_sync_event("presence", "me", Op::Update, &json!({"online": true}))
        .unwrap();
    a.wall.advance(5_000);
    a.write("mem-1", Op::Update, json!({"x": 2}));

    // Expired but not yet on the relay
    assert_eq!(a.engine.prune_expired().unwrap(), 0);
    assert_eq!(a.sync(&relay).await.pushed, 2);
    assert_eq!(a.engine.prune_expired().unwrap(), 1);

    let report = b.sync(&relay).await;
    assert_eq!((report.accepted, report.quarantined), (3, 0));
    assert_eq!(b.memory("mem-1"), json!({"x": 2}));

    // A's chain continues across the pruned event
    a.write("mem-1", Op::Update, json!({"x": 3}));
    a.sync(&relay).await;
    let report = b.sync(&relay).await;
    assert_eq!((report.accepted, report.quarantined), (1, 0));
    assert_eq!(b.memory("mem-1"), json!({"x": 3}));

    // A backup taken after pruning still restores a verifiable chain
    let bundle = a.engine.export_bundle().unwrap();
    assert_eq!((bundle.events.len(), bundle.links.len()), (3, 1));
    let head = bundle.events.last().unwrap().hash;

    let wiped = Device::from_keys(a.engine.keys().clone(), 1_000, |_| {});
    let report = recover_from_bundle(&wiped.engine, bundle).unwrap();
    assert_eq!((report.accepted, report.bridged), (3, 1));
    assert_eq!((report.quarantined, report.integrity_failures), (0, 0));
    assert_eq!(report.chain_head, Some(head));
    assert_eq!(wiped.memory("mem-1"), json!({"x": 3}));
}

#[tokio::test]
async fn replay_leaves_state_and_log_unchanged() {
    let relay = MemoryRelay::new("relay");
    let a = Device::new(1, 1_000);
    let b = Device::new(2, 1_000);
    pair_all(&[&a, &b]);

    a.write("m", Op::Create, json!({"x": 1}));
    a.write("m", Op::Update, json!({"y": 2}));
    a.sync(&relay).await;
    b.sync(&relay).await;

    let states = values(&b);
    let log = b.engine.export_event_log().unwrap();

    let report = b.engine.import_event_log(relay.all_events()).unwrap();
    assert_eq!((report.accepted, report.duplicates), (0, 2));
    assert_eq!(values(&b), states);
    assert_eq!(b.engine.export_event_log().unwrap(), log);
}

#[tokio::test]
async fn deadline_keeps_state_consistent() {
    let relay = MemoryRelay::new("slow");
    let slow = relay.with_latency(Duration::from_millis(300));
    let a = Device::with(1, 1_000, |o| o.deadline = Duration::from_millis(50));

    a.write("m", Op::Create, json!({}));
    let report = a.sync(&slow).await;

    assert!(report.timed_out);
    assert_eq!(report.pushed, 0);
    assert!(relay.is_empty());
    let status = a.engine.get_sync_status().unwrap();
    assert!(status.last_sync.is_none());
    assert_eq!(status.unsynced_count, 1);

    // A normal retry picks up where nothing was lost
    let report = a.sync(&relay).await;
    assert!(report.is_complete());
    assert_eq!(report.pushed, 1);
}

#[tokio::test]
async fn cancelled_engine_reports_cancelled_cycle() {
    let relay = MemoryRelay::new("relay");
    let a = Device::new(1, 1_000);
    a.write("m", Op::Create, json!({}));

    a.engine.shutdown();
    let report = a.sync(&relay).await;

    assert!(report.cancelled);
    assert!(relay.is_empty());
    assert_eq!(a.engine.get_sync_status().unwrap().unsynced_count, 1);
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let relay = MemoryRelay::new("relay");
    let a = Device::new(1, 1_000);
    a.write("m", Op::Create, json!({}));

    relay.fail_next_pulls(1);
    relay.fail_next_pushes(2);
    let report = a.sync(&relay).await;

    assert_eq!(report.pushed, 1);
    assert_eq!(relay.request_counts(), (2, 3));
}

#[tokio::test]
async fn overlapping_cycles_are_skipped() {
    let relay = MemoryRelay::new("relay").with_latency(Duration::from_millis(100));
    let a = Device::new(1, 1_000);

    let (first, second) = tokio::join!(a.engine.sync_with(&relay), a.engine.sync_with(&relay));
    let outcomes = [first.unwrap(), second.unwrap()];

    assert_eq!(
        outcomes
            .iter()
            .filter(|o| matches!(o, SyncOutcome::Skipped))
            .count(),
        1
    );
    assert_eq!(relay.request_counts().0, 1);
}

#[tokio::test]
async fn push_is_batched() {
    let relay = MemoryRelay::new("relay");
    let a = Device::with(1, 1_000, |o| o.push_batch = 2);
    for n in 0..5 {
        a.write(&format!("m{n}"), Op::Create, json!({"n": n}));
    }

    let report = a.sync(&relay).await;
    assert_eq!(report.pushed, 5);
    assert_eq!(relay.request_counts().1, 3);
    assert_eq!(relay.len(), 5);
}

#[tokio::test]
async fn recover_from_relay_after_wipe() {
    let relay = MemoryRelay::new("relay");
    let a = Device::new(1, 1_000);
    let b = Device::new(2, 1_000);
    pair_all(&[&a, &b]);

    a.write("m", Op::Create, json!({"x": 1}));
    a.write("m", Op::Update, json!({"x": 2}));
    b.write("other", Op::Create, json!({"y": 1}));
    a.sync(&relay).await;
    b.sync(&relay).await;
    let head = a.engine.export_event_log().unwrap().last().unwrap().hash;

    // Same identity, empty log
    let wiped = Device::from_keys(a.engine.keys().clone(), 1_000, |_| {});
    wiped
        .engine
        .pair(b.engine.device_id(), b.engine.keys().public_key())
        .unwrap();

    let report = recover_from_relay(&wiped.engine, &relay).await.unwrap();
    assert_eq!(report.accepted, 3);
    assert_eq!(report.devices, 2);
    assert_eq!(report.entities, 2);
    assert_eq!(report.integrity_failures, 0);
    assert_eq!(report.chain_head, Some(head));
    assert_eq!(wiped.memory("m"), json!({"x": 2}));

    // New local writes extend the recovered chain
    let event = wiped
        .engine
        .create_sync_event("memory", "m", Op::Update, &json!({"x": 3}))
        .unwrap();
    assert_eq!(event.prev_hash, Some(head));

    // Nothing new to pull after recovery
    let cycle = wiped.sync(&relay).await;
    assert_eq!(cycle.accepted, 0);
    assert_eq!(cycle.pushed, 3);
}

#[tokio::test]
async fn recovery_skips_unverifiable_events() {
    let relay = MemoryRelay::new("relay");
    let a = Device::new(1, 1_000);
    let stranger = Device::with(9, 1_000, |_| {});
    a.write("m", Op::Create, json!({"x": 1}));
    stranger.write("s", Op::Create, json!({}));
    a.sync(&relay).await;
    stranger.sync(&relay).await;

    let wiped = Device::from_keys(a.engine.keys().clone(), 1_000, |_| {});
    let report = recover_from_relay(&wiped.engine, &relay).await.unwrap();

    assert_eq!(report.accepted, 1);
    assert_eq!(report.quarantined, 1);
    assert_eq!(report.integrity_failures, 0);
    assert_eq!(wiped.memory("m"), json!({"x": 1}));
}

#[test]
fn recover_from_cbor_bundle() {
    let a = Device::new(1, 1_000);
    a.write("m", Op::Create, json!({"text": "héllo ✓", "nested": {"list": [1, 2, {}]}}));
    a.write("gone", Op::Create, json!({"x": 1}));
    a.write("gone", Op::Delete, serde_json::Value::Null);

    let bytes = a.engine.export_bundle().unwrap().encode(BundleFormat::Cbor).unwrap();
    let bundle = EventBundle::decode(&bytes).unwrap();

    let wiped = Device::from_keys(a.engine.keys().clone(), 1_000, |_| {});
    let report = recover_from_bundle(&wiped.engine, bundle).unwrap();

    assert_eq!(report.accepted, 3);
    assert_eq!(values(&wiped), values(&a));
    assert_eq!(wiped.memory("gone"), serde_json::Value::Null);
}

#[test]
fn engine_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = AgentConfig::with_data_dir(dir.path().to_path_buf());

    let (device_id, last) = {
        let engine = SyncEngine::open(&config).unwrap();
        engine
            .create_sync_event("memory", "m", Op::Create, &json!({"x": 1}))
            .unwrap();
        let last = engine
            .create_sync_event("memory", "m", Op::Update, &json!({"x": 2}))
            .unwrap();
        (engine.device_id(), last)
    };

    let engine = SyncEngine::open(&config).unwrap();
    assert_eq!(engine.device_id(), device_id);
    assert_eq!(engine.state("memory", "m").unwrap().value(), json!({"x": 2}));

    let next = engine
        .create_sync_event("memory", "m", Op::Update, &json!({"x": 3}))
        .unwrap();
    assert!(next.hlc > last.hlc);
    assert_eq!(next.prev_hash, Some(last.hash));
    assert_eq!(engine.get_sync_status().unwrap().events_in_log, 3);
}

#[test]
fn corrupted_chain_head_halts_local_writes() {
    let dir = tempfile::tempdir().unwrap();
    let config = AgentConfig::with_data_dir(dir.path().to_path_buf());
    let engine = SyncEngine::open(&config).unwrap();
    let mut rx = engine.subscribe();

    engine
        .create_sync_event("memory", "m", Op::Create, &json!({"x": 1}))
        .unwrap();

    // Corrupt the stored chain head behind the engine's back
    let conn = rusqlite::Connection::open(&config.db_path).unwrap();
    conn.execute(
        "UPDATE chain_heads SET hash = randomblob(32) WHERE device_id = ?1",
        [engine.device_id().to_string()],
    )
    .unwrap();

    let err = engine
        .create_sync_event("memory", "m", Op::Update, &json!({"x": 2}))
        .unwrap_err();
    assert!(matches!(err, SyncError::ChainIntegrity { .. }));
    assert!(matches!(
        engine.create_sync_event("memory", "m", Op::Update, &json!({"x": 3})),
        Err(SyncError::LogHalted)
    ));

    let status = engine.get_sync_status().unwrap();
    assert!(status.chain_halted);
    assert_eq!(status.events_in_log, 1);
    assert_eq!(engine.export_event_log().unwrap().len(), 1);
    assert_eq!(engine.state("memory", "m").unwrap().value(), json!({"x": 1}));

    let halted = std::iter::from_fn(|| rx.try_recv().ok())
        .any(|n| matches!(n, SyncNotification::ChainHalted { .. }));
    assert!(halted);

    // Explicit repair resumes writes on the stored head
    engine.repair_chain_head().unwrap();
    engine
        .create_sync_event("memory", "m", Op::Update, &json!({"x": 4}))
        .unwrap();
    assert!(!engine.get_sync_status().unwrap().chain_halted);
}
