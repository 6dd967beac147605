//! Time-partitioned transaction log
//!
//! Each period (month or day) gets its own RocksDB column family, created
//! ahead of time by [`PartitionManager::ensure_provisioned`]. Writes whose
//! timestamp falls outside every provisioned range go to the catch-all
//! partition [`DEFAULT_PARTITION`].

use crate::{
    config::Granularity,
    metrics::Metrics,
    storage::{Storage, DEFAULT_PARTITION, PARTITION_PREFIX},
    Error, Result,
};
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Persisted partition metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    /// Column family name (`tx_2026_10`, `tx_2026_10_19`)
    pub name: String,
    /// Inclusive lower bound
    pub start: DateTime<Utc>,
    /// Exclusive upper bound
    pub end: DateTime<Utc>,
    /// When the partition was provisioned
    pub created_at: DateTime<Utc>,
}

impl PartitionInfo {
    /// Whether `ts` falls in `[start, end)`
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }
}

/// Partition selected for a write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionHandle {
    /// Column family name
    pub name: String,
    /// `[start, end)` of a provisioned partition, `None` for the catch-all
    pub range: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

impl PartitionHandle {
    /// Whether this is the catch-all partition
    pub fn is_default(&self) -> bool {
        self.range.is_none()
    }
}

/// Partition manager
pub struct PartitionManager {
    storage: Arc<Storage>,
    granularity: Granularity,
    metrics: Arc<Metrics>,
    /// Provisioned partitions keyed by range start
    registry: RwLock<BTreeMap<DateTime<Utc>, PartitionInfo>>,
}

impl std::fmt::Debug for PartitionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionManager")
            .field("granularity", &self.granularity)
            .field("partitions", &self.registry.read().len())
            .finish()
    }
}

impl PartitionManager {
    /// Load the registry from storage
    pub fn load(storage: Arc<Storage>, granularity: Granularity, metrics: Arc<Metrics>) -> Result<Self> {
        let mut registry = BTreeMap::new();
        for info in storage.list_partitions()? {
            if partition_name(info.start, granularity) != info.name {
                return Err(Error::Config(format!(
                    "partition {} was provisioned with a different granularity than {:?}",
                    info.name, granularity
                )));
            }
            // A crash between metadata and CF creation leaves metadata only
            if storage.has_partition(&info.name) {
                registry.insert(info.start, info);
            }
        }

        tracing::info!(
            partitions = registry.len(),
            granularity = ?granularity,
            "Partition registry loaded"
        );

        Ok(Self {
            storage,
            granularity,
            metrics,
            registry: RwLock::new(registry),
        })
    }

    /// Partition for a transaction timestamp.
    ///
    /// Falls back to the catch-all partition, with a warning, when no
    /// provisioned range covers `ts`.
    pub fn resolve(&self, ts: DateTime<Utc>) -> PartitionHandle {
        let registry = self.registry.read();
        if let Some((_, info)) = registry.range(..=ts).next_back() {
            if info.contains(ts) {
                return PartitionHandle {
                    name: info.name.clone(),
                    range: Some((info.start, info.end)),
                };
            }
        }
        drop(registry);

        tracing::warn!(
            timestamp = %ts,
            partition = DEFAULT_PARTITION,
            "No partition covers timestamp, routing to catch-all"
        );
        self.metrics.record_catch_all_write();

        PartitionHandle {
            name: DEFAULT_PARTITION.to_string(),
            range: None,
        }
    }

    /// Create missing partitions from the period containing `now` through
    /// `horizon` periods ahead. Returns the names created.
    pub fn ensure_provisioned(&self, horizon: u32, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut created = Vec::new();
        let mut start = period_start(now, self.granularity)?;

        for _ in 0..=horizon {
            let end = next_period_start(start, self.granularity)?;

            if !self.registry.read().contains_key(&start) {
                let info = PartitionInfo {
                    name: partition_name(start, self.granularity),
                    start,
                    end,
                    created_at: Utc::now(),
                };

                if self.storage.create_partition(&info)? {
                    tracing::info!(
                        partition = %info.name,
                        start = %info.start,
                        end = %info.end,
                        "Partition created"
                    );
                    created.push(info.name.clone());
                }
                self.registry.write().insert(start, info);
            }

            start = end;
        }

        self.metrics.record_partitions_created(created.len());
        Ok(created)
    }

    /// Provisioned partitions, ordered by start
    pub fn partitions(&self) -> Vec<PartitionInfo> {
        self.registry.read().values().cloned().collect()
    }

}

/// Column family name of the partition starting at `start`
pub fn partition_name(start: DateTime<Utc>, granularity: Granularity) -> String {
    match granularity {
        Granularity::Monthly => format!("{}{:04}_{:02}", PARTITION_PREFIX, start.year(), start.month()),
        Granularity::Daily => format!(
            "{}{:04}_{:02}_{:02}",
            PARTITION_PREFIX,
            start.year(),
            start.month(),
            start.day()
        ),
    }
}

fn midnight(date: Option<NaiveDate>) -> Result<DateTime<Utc>> {
    date.and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| Error::InvalidRequest("Timestamp out of partitionable range".to_string()))
}

/// Start of the period containing `ts`
pub fn period_start(ts: DateTime<Utc>, granularity: Granularity) -> Result<DateTime<Utc>> {
    match granularity {
        Granularity::Monthly => midnight(NaiveDate::from_ymd_opt(ts.year(), ts.month(), 1)),
        Granularity::Daily => midnight(Some(ts.date_naive())),
    }
}

/// Start of the period after the one starting at `start`
pub fn next_period_start(start: DateTime<Utc>, granularity: Granularity) -> Result<DateTime<Utc>> {
    match granularity {
        Granularity::Monthly => {
            let (year, month) = if start.month() == 12 {
                (start.year() + 1, 1)
            } else {
                (start.year(), start.month() + 1)
            };
            midnight(NaiveDate::from_ymd_opt(year, month, 1))
        }
        Granularity::Daily => Ok(start + Duration::days(1)),
    }
}
