//! Availability Sampler (C12): periodic self-health probe, SLA windows,
//! outage detection (spec §4.9).

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::db::Database;
use crate::error::{BridgeError, BridgeResult};

const SAMPLE_INTERVAL: Duration = Duration::from_secs(30);
const RETENTION_DAYS: i64 = 90;
const OUTAGE_MIN_DURATION_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HealthSample {
    pub sampled_at: DateTime<Utc>,
    pub bridge_ok: bool,
    pub broker_ok: bool,
    pub tunnel_ok: bool,
}

impl HealthSample {
    pub fn end_to_end_ok(&self) -> bool {
        self.bridge_ok && self.broker_ok && self.tunnel_ok
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaWindow {
    pub window_label: String,
    pub bridge_pct: f64,
    pub broker_pct: f64,
    pub tunnel_pct: f64,
    pub end_to_end_pct: f64,
    pub sample_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outage {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_secs: i64,
    pub affected_components: Vec<String>,
}

/// A pluggable probe for each of the three health booleans; a real
/// deployment checks actual socket/process state, tests inject fixed
/// values.
pub trait HealthProbe: Send + Sync {
    fn bridge_ok(&self) -> bool;
    fn broker_ok(&self) -> bool;
    fn tunnel_ok(&self) -> bool;
}

pub struct AlwaysHealthy;
impl HealthProbe for AlwaysHealthy {
    fn bridge_ok(&self) -> bool { true }
    fn broker_ok(&self) -> bool { true }
    fn tunnel_ok(&self) -> bool { true }
}

pub struct AvailabilitySampler {
    db: Database,
    probe: Arc<dyn HealthProbe>,
    last_sample: RwLock<Option<HealthSample>>,
}

impl AvailabilitySampler {
    pub fn new(db: Database, probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            db,
            probe,
            last_sample: RwLock::new(None),
        }
    }

    pub fn sample_now(&self) -> BridgeResult<HealthSample> {
        let sample = HealthSample {
            sampled_at: Utc::now(),
            bridge_ok: self.probe.bridge_ok(),
            broker_ok: self.probe.broker_ok(),
            tunnel_ok: self.probe.tunnel_ok(),
        };
        self.persist(&sample)?;
        *self.last_sample.write() = Some(sample);
        Ok(sample)
    }

    fn persist(&self, sample: &HealthSample) -> BridgeResult<()> {
        self.db
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO ops_availability (sampled_at, bridge_ok, broker_ok, tunnel_ok) \
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![
                        sample.sampled_at.timestamp_nanos_opt().unwrap_or_default(),
                        sample.bridge_ok as i64,
                        sample.broker_ok as i64,
                        sample.tunnel_ok as i64,
                    ],
                )
            })
            .map_err(BridgeError::from)?;
        Ok(())
    }

    pub fn prune_old_samples(&self) -> BridgeResult<usize> {
        let cutoff = Utc::now() - ChronoDuration::days(RETENTION_DAYS);
        self.db
            .with_conn(|conn| {
                conn.execute(
                    "DELETE FROM ops_availability WHERE sampled_at < ?1",
                    rusqlite::params![cutoff.timestamp_nanos_opt().unwrap_or_default()],
                )
            })
            .map_err(BridgeError::from)
    }

    fn samples_since(&self, since: DateTime<Utc>) -> BridgeResult<Vec<HealthSample>> {
        self.db
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT sampled_at, bridge_ok, broker_ok, tunnel_ok FROM ops_availability \
                     WHERE sampled_at >= ?1 ORDER BY sampled_at ASC",
                )?;
                let rows = stmt.query_map(
                    rusqlite::params![since.timestamp_nanos_opt().unwrap_or_default()],
                    |row| {
                        let sampled_ns: i64 = row.get(0)?;
                        Ok(HealthSample {
                            sampled_at: DateTime::from_timestamp_nanos(sampled_ns),
                            bridge_ok: row.get::<_, i64>(1)? != 0,
                            broker_ok: row.get::<_, i64>(2)? != 0,
                            tunnel_ok: row.get::<_, i64>(3)? != 0,
                        })
                    },
                )?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .map_err(BridgeError::from)
    }

    pub fn sla(&self, window_label: &str, window: ChronoDuration) -> BridgeResult<SlaWindow> {
        let samples = self.samples_since(Utc::now() - window)?;
        let count = samples.len();
        if count == 0 {
            return Ok(SlaWindow {
                window_label: window_label.to_string(),
                bridge_pct: 100.0,
                broker_pct: 100.0,
                tunnel_pct: 100.0,
                end_to_end_pct: 100.0,
                sample_count: 0,
            });
        }
        let pct = |f: fn(&HealthSample) -> bool| {
            samples.iter().filter(|s| f(s)).count() as f64 / count as f64 * 100.0
        };
        Ok(SlaWindow {
            window_label: window_label.to_string(),
            bridge_pct: pct(|s| s.bridge_ok),
            broker_pct: pct(|s| s.broker_ok),
            tunnel_pct: pct(|s| s.tunnel_ok),
            end_to_end_pct: pct(|s| s.end_to_end_ok()),
            sample_count: count,
        })
    }

    pub fn standard_windows(&self) -> BridgeResult<Vec<SlaWindow>> {
        Ok(vec![
            self.sla("1h", ChronoDuration::hours(1))?,
            self.sla("24h", ChronoDuration::hours(24))?,
            self.sla("7d", ChronoDuration::days(7))?,
            self.sla("30d", ChronoDuration::days(30))?,
        ])
    }

    /// Detect outages over the trailing `window` and persist any new ones
    /// into `ops_outages` (spec's own supplement, C12). A deterministic id
    /// derived from the outage's start/end timestamps makes repeated scans
    /// over overlapping windows idempotent rather than duplicating rows.
    pub fn detect_and_persist_outages(&self, window: ChronoDuration) -> BridgeResult<Vec<Outage>> {
        let samples = self.samples_since(Utc::now() - window)?;
        let outages = self.detect_outages(&samples);
        for outage in &outages {
            self.persist_outage(outage)?;
        }
        Ok(outages)
    }

    fn persist_outage(&self, outage: &Outage) -> BridgeResult<()> {
        let affected_json =
            serde_json::to_string(&outage.affected_components).map_err(|e| BridgeError::Storage(e.to_string()))?;
        let started_ns = outage.started_at.timestamp_nanos_opt().unwrap_or_default();
        let ended_ns = outage.ended_at.timestamp_nanos_opt().unwrap_or_default();
        let id = format!("{started_ns}-{ended_ns}");
        self.db
            .with_conn(|conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO ops_outages (id, started_at, ended_at, duration_secs, affected_components_json) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![id, started_ns, ended_ns, outage.duration_secs, affected_json],
                )
            })
            .map_err(BridgeError::from)?;
        Ok(())
    }

    /// Detect contiguous runs of `end_to_end_ok=false` of at least
    /// `OUTAGE_MIN_DURATION_SECS`, reporting which of the three signals
    /// were down at any point during the run.
    pub fn detect_outages(&self, samples: &[HealthSample]) -> Vec<Outage> {
        let mut outages = Vec::new();
        let mut run_start: Option<usize> = None;

        for (i, sample) in samples.iter().enumerate() {
            if !sample.end_to_end_ok() {
                if run_start.is_none() {
                    run_start = Some(i);
                }
            } else if let Some(start) = run_start.take() {
                push_outage_if_long_enough(&mut outages, &samples[start..i]);
            }
        }
        if let Some(start) = run_start {
            push_outage_if_long_enough(&mut outages, &samples[start..]);
        }
        outages
    }
}

fn push_outage_if_long_enough(outages: &mut Vec<Outage>, run: &[HealthSample]) {
    if run.is_empty() {
        return;
    }
    let started_at = run.first().unwrap().sampled_at;
    let ended_at = run.last().unwrap().sampled_at + ChronoDuration::seconds(
        SAMPLE_INTERVAL.as_secs() as i64
    );
    let duration_secs = (ended_at - started_at).num_seconds();
    if duration_secs < OUTAGE_MIN_DURATION_SECS {
        return;
    }

    let mut affected = Vec::new();
    if run.iter().any(|s| !s.bridge_ok) {
        affected.push("bridge".to_string());
    }
    if run.iter().any(|s| !s.broker_ok) {
        affected.push("broker".to_string());
    }
    if run.iter().any(|s| !s.tunnel_ok) {
        affected.push("tunnel".to_string());
    }

    outages.push(Outage {
        started_at,
        ended_at,
        duration_secs,
        affected_components: affected,
    });
}
