//! Store key layout. Every key the workers touch is built here.

use chrono::{DateTime, Utc};

use crate::models::{DeviceAggregates, DeviceClass, DEFAULT_FIRMWARE};

use super::{StoreOp, WriteBatch};

pub const ACTIVE_SENSES: &str = "active_senses";
pub const ACTIVE_PILLS: &str = "active_pills";
pub const FIRMWARES_SEEN: &str = "firmwares_seen";
pub const TOP_FIRMWARES_SEEN: &str = "top_firmwares_seen";
pub const WIFI_INFO: &str = "wifi_info";
pub const SENSE_UPTIMES: &str = "sense_uptimes";
pub const CHECKPOINT_TRACK_PREFIX: &str = "checkpoint_track";

const HOUR_MS: i64 = 60 * 60 * 1000;
/// Hourly presence sets live for two days past the start of their hour.
pub const HOURLY_KEY_TTL_SECS: i64 = 48 * 60 * 60;

fn utc(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

pub fn active_key(class: DeviceClass) -> &'static str {
    match class {
        DeviceClass::Sense => ACTIVE_SENSES,
        DeviceClass::Pill => ACTIVE_PILLS,
    }
}

/// Start of the UTC hour containing `millis`.
pub fn hour_start_millis(millis: i64) -> i64 {
    millis - millis.rem_euclid(HOUR_MS)
}

/// `hourly_active_sense_2024_03_05_17_00`
pub fn hourly_active_key(class: DeviceClass, now_millis: i64) -> String {
    let hour = utc(hour_start_millis(now_millis));
    format!(
        "hourly_active_{}_{}",
        class.as_str(),
        hour.format("%Y_%m_%d_%H_00")
    )
}

/// Epoch seconds at which the hourly key for `now_millis` expires.
pub fn hourly_expire_at(now_millis: i64) -> i64 {
    hour_start_millis(now_millis) / 1000 + HOURLY_KEY_TTL_SECS
}

pub fn device_key(device_id: &str) -> String {
    format!("device_id:{device_id}")
}

/// Checkpoint trail ordering key, e.g. `2024-03-05 17:04:09+0000`.
pub fn checkpoint_ordering_key(millis: i64) -> String {
    utc(millis).format("%Y-%m-%d %H:%M:%S%z").to_string()
}

/// `ZADD active_*` with the last-seen timestamp, plus the current hour's set.
pub fn presence_batch(
    class: DeviceClass,
    aggregates: &DeviceAggregates,
    now_millis: i64,
) -> WriteBatch {
    let mut batch = WriteBatch::new("presence");
    let hourly = hourly_active_key(class, now_millis);

    for (device_id, aggregate) in aggregates {
        let Some(seen_at) = aggregate.last_seen_at else {
            continue;
        };
        batch.ops.push(StoreOp::ZAdd {
            key: active_key(class).to_string(),
            score: seen_at,
            member: device_id.clone(),
        });
        batch.ops.push(StoreOp::SAdd {
            key: hourly.clone(),
            member: device_id.clone(),
        });
    }

    if !batch.is_empty() {
        batch.ops.push(StoreOp::ExpireAt {
            key: hourly,
            at: hourly_expire_at(now_millis),
        });
    }
    batch
}

/// Middle versions go to `firmwares_seen`/`middle:<ver>`, top versions to
/// `top_firmwares_seen`/`top:<ver>`. The unpopulated `"0"` is never written.
/// Every version seen is indexed, but the device hash only takes the newest
/// version of each slot.
pub fn firmware_batch(aggregates: &DeviceAggregates) -> WriteBatch {
    let mut batch = WriteBatch::new("firmware");

    for (device_id, aggregate) in aggregates {
        let slots = [
            (&aggregate.firmware_seen, FIRMWARES_SEEN, "middle_version", "middle"),
            (&aggregate.top_firmware_seen, TOP_FIRMWARES_SEEN, "top_version", "top"),
        ];
        for (seen, seen_key, field, prefix) in slots {
            let mut newest: Option<(&String, i64)> = None;
            for (version, &ts) in seen {
                if version.is_empty() || version == DEFAULT_FIRMWARE {
                    continue;
                }
                batch.ops.push(StoreOp::ZAdd {
                    key: seen_key.to_string(),
                    score: ts,
                    member: version.clone(),
                });
                batch.ops.push(StoreOp::ZAdd {
                    key: format!("{prefix}:{version}"),
                    score: ts,
                    member: device_id.clone(),
                });
                if newest.map_or(true, |(_, newest_ts)| ts >= newest_ts) {
                    newest = Some((version, ts));
                }
            }

            if let Some((version, ts)) = newest {
                batch.ops.push(StoreOp::HSet {
                    key: device_key(device_id),
                    field: field.to_string(),
                    value: version.clone(),
                });
                batch.ops.push(StoreOp::HSet {
                    key: device_key(device_id),
                    field: "timestamp".to_string(),
                    value: ts.to_string(),
                });
            }
        }
    }
    batch
}

/// `HSET wifi_info <device> "<ssid> : <rssi>"`
pub fn wifi_batch(aggregates: &DeviceAggregates) -> WriteBatch {
    let mut batch = WriteBatch::new("wifi");
    for (device_id, aggregate) in aggregates {
        if let Some(wifi) = &aggregate.wifi {
            batch.ops.push(StoreOp::HSet {
                key: WIFI_INFO.to_string(),
                field: device_id.clone(),
                value: format!("{} : {}", wifi.ssid, wifi.rssi),
            });
        }
    }
    batch
}

pub fn uptime_batch(aggregates: &DeviceAggregates) -> WriteBatch {
    let mut batch = WriteBatch::new("uptime");
    for (device_id, aggregate) in aggregates {
        if let Some(uptime) = aggregate.uptime_seconds {
            batch.ops.push(StoreOp::HSet {
                key: SENSE_UPTIMES.to_string(),
                field: device_id.clone(),
                value: uptime.to_string(),
            });
        }
    }
    batch
}

pub fn checkpoint_track_batch(
    partition_key: &str,
    checkpointed_at: i64,
    sequence_number: &str,
) -> WriteBatch {
    let mut batch = WriteBatch::new("checkpoint_track");
    batch.ops.push(StoreOp::HSet {
        key: format!("{CHECKPOINT_TRACK_PREFIX}:{partition_key}"),
        field: checkpoint_ordering_key(checkpointed_at),
        value: sequence_number.to_string(),
    });
    batch
}
