use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, TimeDelta, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::analytics::MinuteSummary;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    counts TEXT NOT NULL,
    traffic_state TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_metrics_timestamp ON metrics(timestamp);
";

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("history lock poisoned")]
    Poisoned,
}

/// A stored minute summary, as returned by `/api/metrics/history`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub counts: BTreeMap<String, u32>,
    pub traffic_state: String,
}

/// One UTC day of stored summaries with per-class peaks.
#[derive(Debug, Clone, Serialize)]
pub struct DailyReport {
    pub date: NaiveDate,
    pub minutes: usize,
    /// Highest per-minute count of each class during the day.
    pub peak_counts: BTreeMap<String, u32>,
    /// Minutes spent in each traffic state.
    pub state_minutes: BTreeMap<String, u32>,
    pub entries: Vec<HistoryEntry>,
}

impl DailyReport {
    fn from_entries(date: NaiveDate, entries: Vec<HistoryEntry>) -> Self {
        let mut peak_counts: BTreeMap<String, u32> = BTreeMap::new();
        let mut state_minutes: BTreeMap<String, u32> = BTreeMap::new();
        for entry in &entries {
            for (class, &count) in &entry.counts {
                let peak = peak_counts.entry(class.clone()).or_default();
                *peak = (*peak).max(count);
            }
            *state_minutes.entry(entry.traffic_state.clone()).or_default() += 1;
        }
        Self {
            date,
            minutes: entries.len(),
            peak_counts,
            state_minutes,
            entries,
        }
    }
}

pub struct MetricsHistory {
    conn: Mutex<Connection>,
}

impl MetricsHistory {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, HistoryError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::with_connection(conn)
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self, HistoryError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, HistoryError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn insert(&self, summary: &MinuteSummary) -> Result<(), HistoryError> {
        let counts = serde_json::to_string(&summary.counts)?;
        let conn = self.conn.lock().map_err(|_| HistoryError::Poisoned)?;
        conn.execute(
            "INSERT INTO metrics (timestamp, counts, traffic_state) VALUES (?1, ?2, ?3)",
            params![
                format_timestamp(summary.timestamp),
                counts,
                summary.traffic_state.as_str()
            ],
        )?;
        Ok(())
    }

    /// Summaries with `start <= timestamp <= end`, oldest first.
    pub fn range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HistoryEntry>, HistoryError> {
        let conn = self.conn.lock().map_err(|_| HistoryError::Poisoned)?;
        let mut stmt = conn.prepare(
            "SELECT timestamp, counts, traffic_state FROM metrics
             WHERE timestamp >= ?1 AND timestamp <= ?2
             ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(
                params![format_timestamp(start), format_timestamp(end)],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;

        let mut entries = Vec::with_capacity(rows.len());
        for (timestamp, counts, traffic_state) in rows {
            let Ok(timestamp) = DateTime::parse_from_rfc3339(&timestamp) else {
                tracing::warn!(timestamp = %timestamp, "skipping history row with bad timestamp");
                continue;
            };
            entries.push(HistoryEntry {
                timestamp: timestamp.with_timezone(&Utc),
                counts: serde_json::from_str(&counts)?,
                traffic_state,
            });
        }
        Ok(entries)
    }

    /// Summaries whose minute falls on `date` (UTC).
    pub fn daily_report(&self, date: NaiveDate) -> Result<DailyReport, HistoryError> {
        let start = date.and_time(NaiveTime::MIN).and_utc();
        let end = start + TimeDelta::days(1) - TimeDelta::seconds(1);
        let entries = self.range(start, end)?;
        Ok(DailyReport::from_entries(date, entries))
    }
}

/// Fixed-width UTC form so text comparison in SQL orders chronologically.
fn format_timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Drains minute summaries into the store off the pipeline threads.
pub fn spawn_history_writer(
    history: Arc<MetricsHistory>,
) -> (mpsc::UnboundedSender<MinuteSummary>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<MinuteSummary>();

    let handle = tokio::spawn(async move {
        while let Some(summary) = rx.recv().await {
            let history = Arc::clone(&history);
            let timestamp = summary.timestamp;
            let result = tokio::task::spawn_blocking(move || history.insert(&summary)).await;
            match result {
                Ok(Ok(())) => tracing::debug!(minute = %timestamp, "minute summary stored"),
                Ok(Err(e)) => tracing::error!(minute = %timestamp, error = %e, "failed to store minute summary"),
                Err(e) => tracing::error!(error = %e, "history insert task panicked"),
            }
        }
        tracing::debug!("history writer stopped");
    });

    (tx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::{ClassLabel, TrafficState};
    use chrono::TimeZone;

    fn summary(minute: u32, cars: u32) -> MinuteSummary {
        let mut counts = BTreeMap::new();
        counts.insert(ClassLabel::Car, cars);
        counts.insert(ClassLabel::Person, 1);
        MinuteSummary {
            timestamp: Utc.with_ymd_and_hms(2026, 3, 1, 8, minute, 0).unwrap(),
            counts,
            traffic_state: if cars >= 15 {
                TrafficState::Saturated
            } else {
                TrafficState::Fluid
            },
        }
    }

    #[test]
    fn range_is_inclusive_and_ordered() {
        let history = MetricsHistory::in_memory().unwrap();
        history.insert(&summary(2, 3)).unwrap();
        history.insert(&summary(0, 1)).unwrap();
        history.insert(&summary(1, 20)).unwrap();
        history.insert(&summary(5, 4)).unwrap();

        let start = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 3, 1, 8, 2, 0).unwrap();
        let rows = history.range(start, end).unwrap();

        let minutes: Vec<_> = rows.iter().map(|r| r.timestamp).collect();
        assert_eq!(
            minutes,
            vec![
                start,
                Utc.with_ymd_and_hms(2026, 3, 1, 8, 1, 0).unwrap(),
                end
            ]
        );
        assert_eq!(rows[1].counts["Car"], 20);
        assert_eq!(rows[1].traffic_state, "saturated");
    }

    #[test]
    fn empty_range() {
        let history = MetricsHistory::in_memory().unwrap();
        history.insert(&summary(0, 1)).unwrap();
        let start = Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap();
        assert!(history.range(start, start).unwrap().is_empty());
    }

    #[test]
    fn daily_report_covers_one_utc_day() {
        let history = MetricsHistory::in_memory().unwrap();
        history.insert(&summary(0, 3)).unwrap();
        history.insert(&summary(1, 20)).unwrap();
        history.insert(&summary(2, 7)).unwrap();
        let mut late = summary(0, 9);
        late.timestamp = Utc.with_ymd_and_hms(2026, 3, 1, 23, 59, 0).unwrap();
        history.insert(&late).unwrap();
        let mut next_day = summary(0, 40);
        next_day.timestamp = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();
        history.insert(&next_day).unwrap();

        let report = history
            .daily_report(NaiveDate::from_ymd_opt(2026, 3, 1).unwrap())
            .unwrap();
        assert_eq!(report.minutes, 4);
        assert_eq!(report.entries.len(), 4);
        assert_eq!(report.peak_counts["Car"], 20);
        assert_eq!(report.peak_counts["Person"], 1);
        assert_eq!(report.state_minutes["saturated"], 1);
        assert_eq!(report.state_minutes["fluid"], 3);
        assert_eq!(report.entries.last().unwrap().timestamp, late.timestamp);

        let empty = history
            .daily_report(NaiveDate::from_ymd_opt(2026, 2, 28).unwrap())
            .unwrap();
        assert_eq!(empty.minutes, 0);
        assert!(empty.peak_counts.is_empty());
    }

    #[tokio::test]
    async fn writer_persists_summaries() {
        let dir = tempfile::tempdir().unwrap();
        let history = Arc::new(MetricsHistory::open(dir.path().join("traffic.db")).unwrap());
        let (tx, handle) = spawn_history_writer(Arc::clone(&history));

        tx.send(summary(0, 2)).unwrap();
        tx.send(summary(1, 3)).unwrap();
        drop(tx);
        handle.await.unwrap();

        let start = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();
        assert_eq!(history.range(start, end).unwrap().len(), 2);
    }
}
