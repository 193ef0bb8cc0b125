//! JSON-lines store: one file per record kind, one JSON object per line.
//!
//! Appends are a single buffered write so partially-written lines are the
//! only corruption mode; reads skip lines that fail to parse rather than
//! failing the query. The experiment record is written atomically via a
//! temp file rename.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::errors::{Error, Result};

use super::{
    ChannelDataPoint, ChannelRecord, ExperimentRecord, FeeChangeRecord, TimeSeriesStore,
};

const EXPERIMENT_FILE: &str = "experiment.json";
const CHANNELS_FILE: &str = "channels.jsonl";
const DATA_POINTS_FILE: &str = "data_points.jsonl";
const FEE_CHANGES_FILE: &str = "fee_changes.jsonl";

/// Append-only JSON-lines store rooted at a data directory.
#[derive(Debug, Clone)]
pub struct JsonlStore {
    dir: PathBuf,
}

impl JsonlStore {
    /// Open (and create if needed) the store directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| Error::persistence(format!("create {}: {e}", dir.display())))?;
        Ok(Self { dir })
    }

    /// Load the experiment record from a previous run, if one exists.
    pub fn load_experiment(&self) -> Result<Option<ExperimentRecord>> {
        let path = self.dir.join(EXPERIMENT_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .map_err(|e| Error::persistence(format!("read {}: {e}", path.display())))?;
        let record = serde_json::from_str(&content)
            .map_err(|e| Error::persistence(format!("parse {}: {e}", path.display())))?;
        Ok(Some(record))
    }

    /// Latest saved row per channel (later appends win).
    pub fn load_channels(&self) -> Result<Vec<ChannelRecord>> {
        let rows: Vec<ChannelRecord> = self.read_all(CHANNELS_FILE)?;
        let mut latest: std::collections::HashMap<String, ChannelRecord> =
            std::collections::HashMap::new();
        for row in rows {
            latest.insert(row.channel_id.clone(), row);
        }
        Ok(latest.into_values().collect())
    }

    fn append_line<T: Serialize>(&self, file: &str, record: &T) -> Result<()> {
        let path = self.dir.join(file);
        let line = serde_json::to_string(record)
            .map_err(|e| Error::persistence(format!("serialize for {file}: {e}")))?;
        let mut handle = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::persistence(format!("open {}: {e}", path.display())))?;
        writeln!(handle, "{line}")
            .map_err(|e| Error::persistence(format!("write {}: {e}", path.display())))
    }

    fn read_all<T: DeserializeOwned>(&self, file: &str) -> Result<Vec<T>> {
        let path = self.dir.join(file);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let handle = fs::File::open(&path)
            .map_err(|e| Error::persistence(format!("open {}: {e}", path.display())))?;
        let mut records = Vec::new();
        for (lineno, line) in BufReader::new(handle).lines().enumerate() {
            let line =
                line.map_err(|e| Error::persistence(format!("read {}: {e}", path.display())))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    // A torn tail line from a crash is expected; anything
                    // else is still not worth failing a query over.
                    warn!(file = %file, line = lineno + 1, error = %e, "skipping bad record");
                }
            }
        }
        Ok(records)
    }

    fn write_atomic(&self, file: &str, json: &str) -> Result<()> {
        let path = self.dir.join(file);
        let tmp = self.dir.join(format!("{file}.tmp"));
        fs::write(&tmp, json)
            .map_err(|e| Error::persistence(format!("write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, &path)
            .map_err(|e| Error::persistence(format!("rename {}: {e}", path.display())))
    }

    /// The directory this store writes into.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl TimeSeriesStore for JsonlStore {
    fn save_experiment(&self, record: &ExperimentRecord) -> Result<()> {
        let json = serde_json::to_string_pretty(record)
            .map_err(|e| Error::persistence(format!("serialize experiment: {e}")))?;
        self.write_atomic(EXPERIMENT_FILE, &json)
    }

    fn save_channel(&self, record: &ChannelRecord) -> Result<()> {
        self.append_line(CHANNELS_FILE, record)
    }

    fn append_data_point(&self, point: &ChannelDataPoint) -> Result<()> {
        self.append_line(DATA_POINTS_FILE, point)
    }

    fn append_change(&self, change: &FeeChangeRecord) -> Result<()> {
        self.append_line(FEE_CHANGES_FILE, change)
    }

    fn query_recent(
        &self,
        channel_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ChannelDataPoint>> {
        let mut points: Vec<ChannelDataPoint> = self
            .read_all::<ChannelDataPoint>(DATA_POINTS_FILE)?
            .into_iter()
            .filter(|p| p.channel_id == channel_id && p.at >= since)
            .collect();
        points.sort_by_key(|p| p.at);
        Ok(points)
    }

    fn query_rollbacks(&self) -> Result<Vec<FeeChangeRecord>> {
        Ok(self
            .read_all::<FeeChangeRecord>(FEE_CHANGES_FILE)?
            .into_iter()
            .filter(|c| c.is_rollback())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn point(channel: &str, at: DateTime<Utc>, earned: u64) -> ChannelDataPoint {
        ChannelDataPoint {
            at,
            experiment_hour: 0,
            channel_id: channel.to_string(),
            segment: "med_cap_active".to_string(),
            parameter_set: "conservative".to_string(),
            outbound_fee_ppm: 100,
            outbound_base_msat: 0,
            inbound_fee_ppm: 0,
            local_balance_sat: 1,
            remote_balance_sat: 1,
            balance_ratio: 0.5,
            forwarded_in_msat: 10,
            forwarded_out_msat: 10,
            fee_earned_msat: earned,
        }
    }

    #[test]
    fn test_append_and_query_recent() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::open(dir.path()).unwrap();
        let now = Utc::now();

        store
            .append_data_point(&point("a", now - Duration::hours(3), 1))
            .unwrap();
        store
            .append_data_point(&point("a", now - Duration::hours(1), 2))
            .unwrap();
        store
            .append_data_point(&point("b", now - Duration::hours(1), 3))
            .unwrap();

        let recent = store
            .query_recent("a", now - Duration::hours(2))
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].fee_earned_msat, 2);
    }

    #[test]
    fn test_query_rollbacks_filters_by_reason() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::open(dir.path()).unwrap();
        let change = FeeChangeRecord {
            at: Utc::now(),
            channel_id: "a".to_string(),
            parameter_set: "aggressive".to_string(),
            old_outbound_ppm: 200,
            new_outbound_ppm: 100,
            old_inbound_ppm: 0,
            new_inbound_ppm: 0,
            reason: "[FLOW] attract traffic".to_string(),
            success: true,
        };
        store.append_change(&change).unwrap();
        store
            .append_change(&FeeChangeRecord {
                reason: "ROLLBACK: revenue decline 41.0%".to_string(),
                ..change.clone()
            })
            .unwrap();

        let rollbacks = store.query_rollbacks().unwrap();
        assert_eq!(rollbacks.len(), 1);
        assert!(rollbacks[0].is_rollback());
    }

    #[test]
    fn test_bad_line_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::open(dir.path()).unwrap();
        let now = Utc::now();
        store.append_data_point(&point("a", now, 1)).unwrap();
        // Simulate a torn write.
        let path = dir.path().join(DATA_POINTS_FILE);
        let mut handle = OpenOptions::new().append(true).open(path).unwrap();
        writeln!(handle, "{{\"at\": \"not a record").unwrap();

        let recent = store.query_recent("a", now - Duration::hours(1)).unwrap();
        assert_eq!(recent.len(), 1);
    }

    #[test]
    fn test_experiment_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::open(dir.path()).unwrap();
        assert!(store.load_experiment().unwrap().is_none());

        let record = ExperimentRecord {
            started_at: Utc::now(),
            channel_count: 12,
        };
        store.save_experiment(&record).unwrap();
        let loaded = store.load_experiment().unwrap().unwrap();
        assert_eq!(loaded.channel_count, 12);
    }

    #[test]
    fn test_latest_channel_row_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::open(dir.path()).unwrap();
        let mut row = ChannelRecord {
            channel_id: "a".to_string(),
            segment: "low_cap_inactive".to_string(),
            capacity_sat: 500_000,
            monthly_flow_msat: 0,
            peer_pubkey: "02abc".to_string(),
            baseline_outbound_ppm: 100,
            baseline_inbound_ppm: 0,
            current_outbound_ppm: 100,
            current_inbound_ppm: 0,
        };
        store.save_channel(&row).unwrap();
        row.current_outbound_ppm = 180;
        store.save_channel(&row).unwrap();

        let channels = store.load_channels().unwrap();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].current_outbound_ppm, 180);
    }
}
