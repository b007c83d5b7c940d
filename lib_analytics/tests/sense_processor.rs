use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use lib_analytics::errors::CheckpointCommitError;
use lib_analytics::membership::ROTATION_PERIOD_MS;
use lib_analytics::sinks::StoreOp;
use lib_analytics::{
    AnomalyKind, Checkpointer, Clock, MemorySink, ProcessorSettings, ProcessorState, RawRecord,
    ShardProcessor, ShutdownReason,
};
use serde_json::json;

// 2024-03-05 17:04:09.123 UTC
const NOW: i64 = 1_709_658_249_123;

struct FixedClock(i64);

impl Clock for FixedClock {
    fn now_millis(&self) -> i64 {
        self.0
    }
}

/// A clock the test moves by hand.
struct ManualClock(AtomicI64);

impl ManualClock {
    fn set(&self, millis: i64) {
        self.0.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct CountingCheckpointer {
    commits: usize,
    reject: bool,
}

#[async_trait]
impl Checkpointer for CountingCheckpointer {
    async fn checkpoint(&mut self) -> Result<(), CheckpointCommitError> {
        self.commits += 1;
        if self.reject {
            return Err(CheckpointCommitError::LeaseLost("shard-0".into()));
        }
        Ok(())
    }
}

fn processor(sink: Arc<MemorySink>) -> ShardProcessor {
    processor_with_clock(sink, Arc::new(FixedClock(NOW)))
}

fn processor_with_clock(sink: Arc<MemorySink>, clock: Arc<dyn Clock>) -> ShardProcessor {
    let mut processor = ShardProcessor::new(ProcessorSettings::default(), sink, clock)
        .expect("default settings are valid");
    processor.initialize("shard-0").expect("fresh processor initializes");
    processor
}

fn record(seq: usize, payload: serde_json::Value) -> RawRecord {
    RawRecord::new(seq.to_string(), "pk", payload.to_string().into_bytes())
}

fn sense(device: &str, received_at: i64, uptime: i64, unix_time: i64) -> serde_json::Value {
    json!({
        "device_id": device,
        "received_at": received_at,
        "uptime_seconds": uptime,
        "samples": [{"unix_time": unix_time, "firmware_version": 5, "wave_count": 2, "co2": 800}]
    })
}

#[tokio::test]
async fn repeated_low_uptime_counts_one_reboot() {
    let sink = Arc::new(MemorySink::new());
    let mut processor = processor(sink.clone());
    let mut checkpointer = CountingCheckpointer::default();

    let batch = vec![
        record(1, sense("sense-1", 1000, 10, 1)),
        record(2, sense("sense-1", 2000, 4000, 2)),
        record(3, sense("sense-1", 3000, 10, 3)),
    ];
    let outcome = processor.process_batch(&batch, &mut checkpointer).await;

    assert_eq!(outcome.decoded, 3);
    assert_eq!(outcome.devices_flushed, 1);
    assert!(outcome.flush_ok);
    assert!(outcome.commit_ok);
    assert_eq!(processor.counters().low_uptime_reboots, 1);
    assert_eq!(processor.counters().wave_count_sum, 6);
    assert_eq!(checkpointer.commits, 1);

    let presence = sink.batches_for("presence");
    assert_eq!(presence.len(), 1);
    assert!(presence[0].ops.contains(&StoreOp::ZAdd {
        key: "active_senses".into(),
        score: 3000,
        member: "sense-1".into()
    }));
    assert!(presence[0].ops.contains(&StoreOp::SAdd {
        key: "hourly_active_sense_2024_03_05_17_00".into(),
        member: "sense-1".into()
    }));

    let uptime = sink.batches_for("uptime");
    assert_eq!(
        uptime[0].ops,
        vec![StoreOp::HSet {
            key: "sense_uptimes".into(),
            field: "sense-1".into(),
            value: "10".into()
        }]
    );
}

#[tokio::test]
async fn reboot_is_not_recounted_in_a_later_batch() {
    let sink = Arc::new(MemorySink::new());
    let mut processor = processor(sink);
    let mut checkpointer = CountingCheckpointer::default();

    processor
        .process_batch(&[record(1, sense("sense-1", 1000, 10, 1))], &mut checkpointer)
        .await;
    processor
        .process_batch(&[record(2, sense("sense-1", 2000, 20, 2))], &mut checkpointer)
        .await;

    assert_eq!(processor.counters().low_uptime_reboots, 1);
    assert_eq!(checkpointer.commits, 2);
}

#[tokio::test]
async fn malformed_record_is_skipped_and_batch_still_commits() {
    let sink = Arc::new(MemorySink::new());
    let mut processor = processor(sink.clone());
    let mut checkpointer = CountingCheckpointer::default();

    let mut batch: Vec<RawRecord> = (1..=5)
        .map(|i| record(i, sense(&format!("sense-{i}"), 1000 * i as i64, 5000, 1)))
        .collect();
    batch[2] = RawRecord::new("3", "pk", b"{\"device_id\": ".to_vec());

    let outcome = processor.process_batch(&batch, &mut checkpointer).await;

    assert_eq!(outcome.records, 5);
    assert_eq!(outcome.decoded, 4);
    assert_eq!(outcome.decode_failures, 1);
    assert_eq!(outcome.devices_flushed, 4);
    assert!(outcome.flush_ok);
    assert_eq!(processor.counters().decode_failures, 1);
    assert_eq!(checkpointer.commits, 1);

    let members: Vec<String> = sink.batches_for("presence")[0]
        .ops
        .iter()
        .filter_map(|op| match op {
            StoreOp::ZAdd { member, .. } => Some(member.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(members, vec!["sense-1", "sense-2", "sense-4", "sense-5"]);
}

#[tokio::test]
async fn sink_failure_is_counted_and_commit_still_attempted() {
    let sink = Arc::new(MemorySink::new());
    sink.set_failing(true);
    let mut processor = processor(sink.clone());
    let mut checkpointer = CountingCheckpointer::default();

    let outcome = processor
        .process_batch(&[record(1, sense("sense-1", 1000, 10, 1))], &mut checkpointer)
        .await;

    assert!(!outcome.flush_ok);
    assert!(outcome.commit_ok);
    assert_eq!(checkpointer.commits, 1);
    // presence, firmware, wifi and uptime each fail on their own
    assert_eq!(processor.counters().sink_failures, 4);
    assert!(sink.batches().is_empty());
}

#[tokio::test]
async fn rejected_commit_is_counted_not_raised() {
    let sink = Arc::new(MemorySink::new());
    let mut processor = processor(sink);
    let mut checkpointer = CountingCheckpointer { reject: true, ..Default::default() };

    let outcome = processor
        .process_batch(&[record(1, sense("sense-1", 1000, 10, 1))], &mut checkpointer)
        .await;

    assert!(outcome.flush_ok);
    assert!(!outcome.commit_ok);
    assert_eq!(processor.counters().commit_failures, 1);
    assert_eq!(processor.state(), ProcessorState::Active);
}

#[tokio::test]
async fn checkpoint_advances_are_rate_limited_and_tracked() {
    let sink = Arc::new(MemorySink::new());
    let mut processor = processor(sink.clone());
    let mut checkpointer = CountingCheckpointer::default();

    let start = 1_709_650_000;
    let batch = vec![
        record(1, sense("sense-1", 1000, 5000, start)),
        record(2, sense("sense-1", 2000, 5000, start + 10 * 60)),
        record(3, sense("sense-1", 3000, 5000, start + 61 * 60)),
    ];
    let outcome = processor.process_batch(&batch, &mut checkpointer).await;

    assert_eq!(outcome.checkpoint_advances, 2);
    assert_eq!(processor.last_checkpointed_at(), Some((start + 61 * 60) * 1000));

    let trail = sink.batches_for("checkpoint_track");
    assert_eq!(trail.len(), 2);
    match &trail[1].ops[0] {
        StoreOp::HSet { key, value, .. } => {
            assert_eq!(key, "checkpoint_track:sense_stats:shard-0");
            assert_eq!(value, "3");
        }
        other => panic!("unexpected trail op {other:?}"),
    }
}

#[tokio::test]
async fn out_of_range_readings_are_counted() {
    let sink = Arc::new(MemorySink::new());
    let mut processor = processor(sink);
    let mut checkpointer = CountingCheckpointer::default();

    let payload = json!({
        "device_id": "sense-1",
        "received_at": 1000,
        "uptime_seconds": 5000,
        "samples": [{"unix_time": 1, "co2": 200}, {"unix_time": 2}]
    });
    processor.process_batch(&[record(1, payload)], &mut checkpointer).await;

    assert_eq!(processor.anomalies().get(AnomalyKind::LowCo2), 1);
    assert_eq!(processor.anomalies().get(AnomalyKind::HighCo2), 0);
    assert_eq!(processor.anomalies().total(), 1);
}

#[tokio::test]
async fn terminate_commits_once_and_zombie_never_commits() {
    let mut checkpointer = CountingCheckpointer::default();
    let mut clean = processor(Arc::new(MemorySink::new()));
    clean
        .shutdown(ShutdownReason::Terminate, &mut checkpointer)
        .await
        .expect("active processor shuts down");
    assert_eq!(checkpointer.commits, 1);
    assert_eq!(clean.state(), ProcessorState::Terminated);

    let mut checkpointer = CountingCheckpointer::default();
    let mut zombie = processor(Arc::new(MemorySink::new()));
    zombie
        .shutdown(ShutdownReason::Zombie, &mut checkpointer)
        .await
        .expect("active processor shuts down");
    assert_eq!(checkpointer.commits, 0);
    assert_eq!(zombie.state(), ProcessorState::Terminated);
}

#[tokio::test]
async fn batches_outside_active_are_ignored() {
    let sink = Arc::new(MemorySink::new());
    let mut processor = ShardProcessor::new(
        ProcessorSettings::default(),
        sink.clone(),
        Arc::new(FixedClock(NOW)),
    )
    .expect("default settings are valid");
    let mut checkpointer = CountingCheckpointer::default();

    let batch = [record(1, sense("sense-1", 1000, 10, 1))];
    let outcome = processor.process_batch(&batch, &mut checkpointer).await;
    assert!(outcome.ignored);

    processor.initialize("shard-0").expect("initializes");
    assert!(processor.initialize("shard-0").is_err());
    processor
        .shutdown(ShutdownReason::Requested, &mut checkpointer)
        .await
        .expect("shuts down");

    let outcome = processor.process_batch(&batch, &mut checkpointer).await;
    assert!(outcome.ignored);
    assert!(processor.shutdown(ShutdownReason::Terminate, &mut checkpointer).await.is_err());
    assert!(sink.batches().is_empty());
    assert_eq!(checkpointer.commits, 1);
}

#[tokio::test]
async fn reboot_filter_rotates_on_the_processor_clock() {
    let sink = Arc::new(MemorySink::new());
    let clock = Arc::new(ManualClock(AtomicI64::new(NOW)));
    let mut processor = processor_with_clock(sink, clock.clone());
    let mut checkpointer = CountingCheckpointer::default();
    let batch = vec![record(1, sense("sense-1", 1000, 10, 1))];

    processor.process_batch(&batch, &mut checkpointer).await;
    assert_eq!(processor.counters().low_uptime_reboots, 1);

    // exactly one rotation period later the filter is still the same one
    clock.set(NOW + ROTATION_PERIOD_MS);
    processor.process_batch(&batch, &mut checkpointer).await;
    assert_eq!(processor.counters().low_uptime_reboots, 1);

    clock.set(NOW + ROTATION_PERIOD_MS + 1);
    processor.process_batch(&batch, &mut checkpointer).await;
    assert_eq!(processor.counters().low_uptime_reboots, 2);

    // the fresh filter dedups again within its own period
    processor.process_batch(&batch, &mut checkpointer).await;
    assert_eq!(processor.counters().low_uptime_reboots, 2);
}

#[tokio::test]
async fn overflowing_timestamps_and_wave_counts_do_not_panic() {
    let sink = Arc::new(MemorySink::new());
    let mut processor = processor(sink.clone());
    let mut checkpointer = CountingCheckpointer::default();

    let huge_wave = json!({
        "device_id": "sense-2",
        "received_at": 2000,
        "uptime_seconds": 5000,
        "samples": [{"unix_time": 1, "wave_count": i64::MAX}, {"unix_time": 2, "wave_count": i64::MAX}]
    });
    let batch = vec![
        record(1, sense("sense-1", 1000, 5000, 9_300_000_000_000_000)),
        record(2, huge_wave),
        record(3, sense("sense-3", 3000, 5000, 1_709_650_000)),
    ];
    let outcome = processor.process_batch(&batch, &mut checkpointer).await;

    assert_eq!(outcome.decode_failures, 1);
    assert_eq!(outcome.decoded, 2);
    assert!(outcome.commit_ok);
    assert_eq!(processor.counters().wave_count_sum, i64::MAX);
    assert_eq!(processor.last_checkpointed_at(), Some(1_709_650_000_000));
}

#[tokio::test]
async fn far_future_first_sample_does_not_stall_the_checkpoint_trail() {
    let sink = Arc::new(MemorySink::new());
    let mut processor = processor(sink.clone());
    let mut checkpointer = CountingCheckpointer::default();

    // 2100-01-01T00:00:00Z from a device with a broken clock
    let outcome = processor
        .process_batch(&[record(1, sense("sense-1", 1000, 5000, 4_102_444_800))], &mut checkpointer)
        .await;
    assert_eq!(outcome.checkpoint_advances, 0);
    assert_eq!(processor.last_checkpointed_at(), Some(0));

    let start = NOW / 1000 - 3 * 3600;
    let batch = vec![
        record(2, sense("sense-1", 2000, 5000, start)),
        record(3, sense("sense-1", 3000, 5000, start + 3600 + 60)),
        record(4, sense("sense-1", 4000, 5000, start + 2 * 3600 + 120)),
    ];
    let outcome = processor.process_batch(&batch, &mut checkpointer).await;

    assert_eq!(outcome.checkpoint_advances, 3);
    assert_eq!(processor.last_checkpointed_at(), Some((start + 2 * 3600 + 120) * 1000));
    assert_eq!(sink.batches_for("checkpoint_track").len(), 3);
}
