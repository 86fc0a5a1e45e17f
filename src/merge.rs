//! Alignment of the accelerometer step timeline with the watch timeline.
//!
//! The watch timeline is the base table: each participant's watch rows are
//! matched to the nearest step row within a tolerance, and no watch row is
//! ever dropped. Watch columns are carried through as text so the merged
//! file keeps whatever the watch export contained.

use std::collections::BTreeMap;
use std::path::Path;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::config::{MergeConfig, MergeKey};
use crate::data_loading::{self, parse_optional_f64, parse_timestamp, CsvTable};
use crate::error::{CadenceError, Result};
use crate::Timestamp;

/// Plausible average stride length, in meters.
const MIN_STRIDE_M: f64 = 0.4;
const MAX_STRIDE_M: f64 = 1.5;

/// One row of the step timeline file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRow {
    pub march_id: i64,
    pub user_id: String,
    #[serde(with = "data_loading::timestamp")]
    pub timestamp: Timestamp,
    pub steps_per_second: f64,
    pub cumulative_steps: f64,
    pub sample: usize,
    pub window_size_seconds: u32,
    pub timestamp_minutes: f64,
}

impl StepRow {
    fn key(&self, key: MergeKey) -> f64 {
        match key {
            MergeKey::Timestamp => seconds(self.timestamp),
            MergeKey::TimestampMinutes => self.timestamp_minutes,
        }
    }
}

/// One row of the watch timeline, with the fields the merge reads parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchRow {
    pub march_id: i64,
    pub user_id: String,
    pub timestamp: Option<Timestamp>,
    pub timestamp_minutes: Option<f64>,
    pub steps: Option<f64>,
    pub cumulative_distance_km: Option<f64>,
    /// Every column as read, in header order.
    pub fields: Vec<String>,
}

impl WatchRow {
    fn key(&self, key: MergeKey) -> Option<f64> {
        match key {
            MergeKey::Timestamp => self.timestamp.map(seconds),
            MergeKey::TimestampMinutes => self.timestamp_minutes,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WatchTable {
    pub headers: Vec<String>,
    pub rows: Vec<WatchRow>,
}

impl WatchTable {
    pub fn from_table(path: &Path, table: CsvTable) -> Result<Self> {
        let required = |name: &str| {
            table.column(name).ok_or_else(|| CadenceError::MissingColumn {
                path: path.to_path_buf(),
                column: name.to_string(),
            })
        };
        let march_col = required("march_id")?;
        let user_col = required("user_id")?;
        let timestamp_col = table.column("timestamp");
        let minutes_col = table.column("timestamp_minutes");
        let steps_col = table.column("steps");
        let distance_col = table.column("cumulative_distance_km");

        let cell = |fields: &[String], col: Option<usize>| -> Option<String> {
            col.and_then(|c| fields.get(c)).cloned()
        };

        let mut rows = Vec::with_capacity(table.rows.len());
        for fields in table.rows {
            let march_raw = cell(&fields, Some(march_col)).unwrap_or_default();
            let march_id = parse_optional_f64(&march_raw)
                .map(|v| v as i64)
                .ok_or_else(|| CadenceError::MissingColumn {
                    path: path.to_path_buf(),
                    column: format!("march_id (value {march_raw:?})"),
                })?;
            let timestamp = match cell(&fields, timestamp_col) {
                Some(raw) if !raw.trim().is_empty() => Some(parse_timestamp(&raw)?),
                _ => None,
            };

            rows.push(WatchRow {
                march_id,
                user_id: cell(&fields, Some(user_col)).unwrap_or_default(),
                timestamp,
                timestamp_minutes: cell(&fields, minutes_col).and_then(|v| parse_optional_f64(&v)),
                steps: cell(&fields, steps_col).and_then(|v| parse_optional_f64(&v)),
                cumulative_distance_km: cell(&fields, distance_col)
                    .and_then(|v| parse_optional_f64(&v)),
                fields,
            });
        }

        Ok(Self {
            headers: table.headers,
            rows,
        })
    }

    pub fn read(path: &Path) -> Result<Self> {
        Self::from_table(path, data_loading::read_table(path)?)
    }
}

/// A watch row after the merge.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedRow {
    pub watch: WatchRow,
    /// Cumulative steps: accelerometer where matched, watch otherwise, or
    /// estimated from distance.
    pub steps: Option<f64>,
    pub steps_per_second: Option<f64>,
}

impl MergedRow {
    fn unmatched(watch: WatchRow) -> Self {
        Self {
            steps: watch.steps,
            steps_per_second: None,
            watch,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedTimeline {
    pub headers: Vec<String>,
    pub rows: Vec<MergedRow>,
}

pub(crate) fn seconds(t: Timestamp) -> f64 {
    t.and_utc().timestamp_millis() as f64 / 1000.0
}

/// Nearest entry to `key` within `tolerance`, ties going to the earlier
/// entry. `keyed` must be sorted by key.
pub(crate) fn nearest<T: Copy>(keyed: &[(f64, T)], key: f64, tolerance: f64) -> Option<T> {
    let after = keyed.partition_point(|(k, _)| *k < key);
    let before = keyed.partition_point(|(k, _)| *k <= key);

    let backward = before.checked_sub(1).map(|i| keyed[i]);
    let forward = keyed.get(after).copied();

    let (k, row) = match (backward, forward) {
        (Some(b), Some(f)) => {
            if (f.0 - key) < (key - b.0) {
                f
            } else {
                b
            }
        }
        (Some(b), None) => b,
        (None, Some(f)) => f,
        (None, None) => return None,
    };
    ((k - key).abs() <= tolerance).then_some(row)
}

/// Average stride from the furthest known distance and step count, when it
/// is plausible.
fn stride_length(rows: &[MergedRow], matched: &[Option<f64>]) -> Option<f64> {
    let mut max_distance_km = f64::NEG_INFINITY;
    let mut max_steps = f64::NEG_INFINITY;
    for (row, acc) in rows.iter().zip(matched) {
        if let (Some(distance), Some(steps)) = (row.watch.cumulative_distance_km, acc) {
            if distance > 0.0 && *steps > 0.0 {
                max_distance_km = max_distance_km.max(distance);
                max_steps = max_steps.max(*steps);
            }
        }
    }
    if !(max_distance_km > 0.0 && max_steps > 0.0) {
        return None;
    }

    let stride = max_distance_km * 1000.0 / max_steps;
    if (MIN_STRIDE_M..=MAX_STRIDE_M).contains(&stride) {
        info!(
            "  Stride length {stride:.2}m (from {max_distance_km:.2}km / {} steps)",
            max_steps as i64
        );
        Some(stride)
    } else {
        warn!("  Invalid stride length {stride:.2}m - skipping estimation");
        None
    }
}

/// Merges one participant's rows.
pub fn merge_participant(
    watch: Vec<WatchRow>,
    steps: &[&StepRow],
    config: &MergeConfig,
) -> Vec<MergedRow> {
    if steps.is_empty() {
        if let Some(first) = watch.first() {
            warn!(
                "No step data found for {} in march {} - keeping all {} watch records",
                first.user_id,
                first.march_id,
                watch.len()
            );
        }
        return watch.into_iter().map(MergedRow::unmatched).collect();
    }

    let mut keyed: Vec<(f64, &StepRow)> = steps.iter().map(|s| (s.key(config.key), *s)).collect();
    keyed.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut watch = watch;
    // Rows without a key go last and stay unmatched.
    watch.sort_by(|a, b| match (a.key(config.key), b.key(config.key)) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });

    let mut matched = Vec::with_capacity(watch.len());
    let mut rows = Vec::with_capacity(watch.len());
    for row in watch {
        let step = row
            .key(config.key)
            .and_then(|k| nearest(&keyed, k, config.tolerance));
        let acc_steps = step.map(|s| s.cumulative_steps);
        matched.push(acc_steps);
        rows.push(MergedRow {
            steps: acc_steps.or(row.steps),
            steps_per_second: step.map(|s| s.steps_per_second),
            watch: row,
        });
    }

    let hits = matched.iter().filter(|m| m.is_some()).count();
    info!(
        "  Matched {hits}/{} records with step data ({:.1}%)",
        rows.len(),
        hits as f64 / rows.len().max(1) as f64 * 100.0
    );

    if let Some(stride) = stride_length(&rows, &matched) {
        let mut estimated = 0;
        for (row, acc) in rows.iter_mut().zip(&matched) {
            match (row.watch.cumulative_distance_km, acc) {
                (Some(distance), None) if distance > 0.0 => {
                    row.steps = Some(distance * 1000.0 / stride);
                    estimated += 1;
                }
                _ => {}
            }
        }
        if estimated > 0 {
            info!("  Estimated steps for {estimated} rows using stride length {stride:.2}m");
        }
    }

    rows
}

/// Left-joins the step timeline onto the watch timeline, participant by
/// participant.
pub fn merge_timelines(
    watch: WatchTable,
    steps: &[StepRow],
    config: &MergeConfig,
) -> MergedTimeline {
    info!(
        "Merging {} watch records with {} step records on {:?}",
        watch.rows.len(),
        steps.len(),
        config.key
    );

    let mut step_groups: BTreeMap<(i64, &str), Vec<&StepRow>> = BTreeMap::new();
    for step in steps {
        step_groups
            .entry((step.march_id, step.user_id.as_str()))
            .or_default()
            .push(step);
    }

    let mut watch_groups: BTreeMap<(i64, String), Vec<WatchRow>> = BTreeMap::new();
    for row in watch.rows {
        watch_groups
            .entry((row.march_id, row.user_id.clone()))
            .or_default()
            .push(row);
    }

    let total = watch_groups.len();
    let mut with_steps = 0;
    let mut rows = Vec::new();
    for ((march_id, user_id), group) in watch_groups {
        info!("Merging data for {user_id} in march {march_id}");
        let group_steps = step_groups
            .get(&(march_id, user_id.as_str()))
            .map(Vec::as_slice)
            .unwrap_or_default();
        if !group_steps.is_empty() {
            with_steps += 1;
        }
        rows.extend(merge_participant(group, group_steps, config));
    }
    info!(
        "Merge complete: {} records, {total} participants, {with_steps} with step data",
        rows.len()
    );

    MergedTimeline {
        headers: watch.headers,
        rows,
    }
}

/// Adds the step summary columns to the watch health metrics, replacing
/// any watch-side values for participants that have a step summary.
pub fn merge_summaries(health: CsvTable, step_summary: &CsvTable) -> CsvTable {
    const STEP_COLUMNS: [&str; 3] = ["total_steps", "avg_steps_per_second", "window_size_seconds"];

    let key_of = |table: &CsvTable, row: &[String]| -> Option<(i64, String)> {
        let march = table.column("march_id").and_then(|c| row.get(c))?;
        let user = table.column("user_id").and_then(|c| row.get(c))?;
        Some((parse_optional_f64(march)? as i64, user.clone()))
    };

    let step_columns: Vec<(&str, usize)> = STEP_COLUMNS
        .iter()
        .filter_map(|name| step_summary.column(name).map(|c| (*name, c)))
        .collect();

    let mut summaries: BTreeMap<(i64, String), &Vec<String>> = BTreeMap::new();
    for row in &step_summary.rows {
        if let Some(key) = key_of(step_summary, row) {
            summaries.entry(key).or_insert(row);
        }
    }

    let mut headers = health.headers.clone();
    let targets: Vec<usize> = step_columns
        .iter()
        .map(|(name, _)| match headers.iter().position(|h| h == name) {
            Some(c) => c,
            None => {
                headers.push(name.to_string());
                headers.len() - 1
            }
        })
        .collect();

    let mut replaced = 0;
    let rows = health
        .rows
        .iter()
        .map(|row| {
            let mut out = row.clone();
            out.resize(headers.len(), String::new());
            if let Some(summary) = key_of(&health, row).and_then(|k| summaries.get(&k)) {
                replaced += 1;
                for ((_, source), target) in step_columns.iter().zip(&targets) {
                    out[*target] = summary.get(*source).cloned().unwrap_or_default();
                }
            }
            out
        })
        .collect();
    info!("Merged step data: {replaced}/{} participants have step data", health.rows.len());

    CsvTable { headers, rows }
}
