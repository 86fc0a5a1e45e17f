use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{info, warn};
use serde::Serialize;

use crate::data_loading::CsvTable;
use crate::merge::{MergedTimeline, StepRow};
use crate::timeline::StepTimeline;
use crate::watch::WatchRun;
use crate::{CrossingTime, Timestamp};

pub const STEP_DATA_FILE: &str = "march_step_data.csv";
pub const STEP_SUMMARY_FILE: &str = "march_step_summary.csv";
pub const MERGED_DATA_FILE: &str = "march_timeseries_data_merged.csv";
pub const MERGED_SUMMARY_FILE: &str = "march_health_metrics_merged.csv";
pub const CROSSINGS_FILE: &str = "gps_crossing_times.json";
pub const WATCH_DATA_FILE: &str = "march_timeseries_data.csv";
pub const HEALTH_METRICS_FILE: &str = "march_health_metrics.csv";
pub const HR_ZONES_FILE: &str = "march_hr_zones.csv";

#[derive(Debug, Serialize)]
struct StepSummaryRow<'a> {
    march_id: i64,
    user_id: &'a str,
    total_steps: u64,
    avg_steps_per_second: f64,
    window_size_seconds: u32,
}

#[derive(Debug, Serialize)]
struct WatchDataRow<'a> {
    march_id: i64,
    user_id: &'a str,
    #[serde(with = "crate::data_loading::timestamp")]
    timestamp: Timestamp,
    timestamp_minutes: Option<f64>,
    heart_rate: Option<f64>,
    steps: Option<f64>,
    speed_kmh: Option<f64>,
    cumulative_distance_km: Option<f64>,
}

#[derive(Debug, Serialize)]
struct HealthMetricsRow<'a> {
    march_id: i64,
    user_id: &'a str,
    avg_hr: Option<i64>,
    max_hr: Option<i64>,
    total_steps: Option<i64>,
    march_duration_minutes: i64,
    data_completeness: Option<f64>,
    avg_pace_kmh: Option<f64>,
    estimated_distance_km: Option<f64>,
    calories: Option<i64>,
}

#[derive(Debug, Serialize)]
struct HrZonesRow<'a> {
    march_id: i64,
    user_id: &'a str,
    very_light_percent: f64,
    light_percent: f64,
    moderate_percent: f64,
    intense_percent: f64,
    beast_mode_percent: f64,
}

fn create(dir: &Path, name: &str) -> Result<(PathBuf, csv::Writer<std::fs::File>)> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create output directory {}", dir.display()))?;
    let path = dir.join(name);
    let writer = csv::Writer::from_path(&path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    Ok((path, writer))
}

/// Flattens timelines into output rows. Minutes are counted from the march
/// start, or from each participant's first window without one.
pub fn step_rows(
    march_id: i64,
    march_start: Option<Timestamp>,
    timelines: &[StepTimeline],
) -> Vec<StepRow> {
    timelines
        .iter()
        .flat_map(|timeline| {
            let minutes = timeline.timestamp_minutes(march_start);
            timeline
                .rows
                .iter()
                .zip(minutes)
                .map(move |(row, timestamp_minutes)| StepRow {
                    march_id,
                    user_id: timeline.participant_id.clone(),
                    timestamp: row.timestamp,
                    steps_per_second: f64::from(row.sps),
                    cumulative_steps: row.cumulative_steps,
                    sample: row.sample,
                    window_size_seconds: timeline.window_seconds,
                    timestamp_minutes,
                })
        })
        .collect()
}

/// Writes the step timeline and the per-participant summary.
pub fn write_step_outputs(
    dir: &Path,
    march_id: i64,
    march_start: Option<Timestamp>,
    timelines: &[StepTimeline],
) -> Result<()> {
    if timelines.is_empty() {
        warn!("No results to save");
        return Ok(());
    }

    let (path, mut writer) = create(dir, STEP_DATA_FILE)?;
    for row in step_rows(march_id, march_start, timelines) {
        writer.serialize(row)?;
    }
    writer.flush()?;
    info!("Saved step data to {}", path.display());

    let (path, mut writer) = create(dir, STEP_SUMMARY_FILE)?;
    for timeline in timelines {
        let summary = timeline.summary();
        writer.serialize(StepSummaryRow {
            march_id,
            user_id: &summary.participant_id,
            total_steps: summary.total_steps,
            avg_steps_per_second: summary.avg_steps_per_second,
            window_size_seconds: summary.window_seconds,
        })?;
    }
    writer.flush()?;
    info!("Saved step summary to {}", path.display());

    Ok(())
}

/// Writes the merged timeline: watch columns as read, with `steps`
/// replaced (or added) and `steps_per_second` set.
pub fn write_merged_timeline(dir: &Path, merged: &MergedTimeline) -> Result<PathBuf> {
    let mut headers = merged.headers.clone();
    let mut column = |name: &str| match headers.iter().position(|h| h == name) {
        Some(c) => c,
        None => {
            headers.push(name.to_string());
            headers.len() - 1
        }
    };
    let steps_col = column("steps");
    let sps_col = column("steps_per_second");

    let (path, mut writer) = create(dir, MERGED_DATA_FILE)?;
    writer.write_record(&headers)?;
    for row in &merged.rows {
        let mut fields = row.watch.fields.clone();
        fields.resize(headers.len(), String::new());
        // Unchanged watch values keep their original text.
        if row.steps != row.watch.steps {
            fields[steps_col] = row.steps.map(|v| v.to_string()).unwrap_or_default();
        }
        fields[sps_col] = row.steps_per_second.map(|v| v.to_string()).unwrap_or_default();
        writer.write_record(&fields)?;
    }
    writer.flush()?;

    let with_steps = merged.rows.iter().filter(|r| r.steps.is_some_and(|s| s > 0.0)).count();
    info!(
        "Saved merged data to {} ({} records, step data completeness {:.1}%)",
        path.display(),
        merged.rows.len(),
        with_steps as f64 / merged.rows.len().max(1) as f64 * 100.0
    );
    Ok(path)
}

pub fn write_table(dir: &Path, name: &str, table: &CsvTable) -> Result<PathBuf> {
    let (path, mut writer) = create(dir, name)?;
    writer.write_record(&table.headers)?;
    for row in &table.rows {
        writer.write_record(row)?;
    }
    writer.flush()?;
    info!("Saved {} rows to {}", table.rows.len(), path.display());
    Ok(path)
}

/// Writes the watch timeline, health metrics, heart-rate zones and the
/// crossing file. Rows before the march start are not written.
pub fn write_watch_outputs(dir: &Path, march_id: i64, run: &WatchRun) -> Result<()> {
    if run.participants.is_empty() {
        warn!("No watch results to save");
        return Ok(());
    }

    let (path, mut writer) = create(dir, HEALTH_METRICS_FILE)?;
    for p in &run.participants {
        let m = &p.metrics;
        writer.serialize(HealthMetricsRow {
            march_id,
            user_id: &p.participant_id,
            avg_hr: m.avg_hr,
            max_hr: m.max_hr,
            total_steps: m.total_steps,
            march_duration_minutes: m.march_duration_minutes,
            data_completeness: m.data_completeness,
            avg_pace_kmh: m.avg_pace_kmh,
            estimated_distance_km: m.estimated_distance_km,
            calories: m.calories,
        })?;
    }
    writer.flush()?;
    info!("Saved aggregate metrics to {}", path.display());

    if run.participants.iter().any(|p| p.hr_zones.is_some()) {
        let (path, mut writer) = create(dir, HR_ZONES_FILE)?;
        for p in &run.participants {
            let Some(zones) = &p.hr_zones else {
                continue;
            };
            writer.serialize(HrZonesRow {
                march_id,
                user_id: &p.participant_id,
                very_light_percent: zones.very_light_percent,
                light_percent: zones.light_percent,
                moderate_percent: zones.moderate_percent,
                intense_percent: zones.intense_percent,
                beast_mode_percent: zones.beast_mode_percent,
            })?;
        }
        writer.flush()?;
        info!("Saved HR zones to {}", path.display());
    }

    let (path, mut writer) = create(dir, WATCH_DATA_FILE)?;
    let mut negative = 0;
    for p in &run.participants {
        for row in &p.timeseries {
            if row.timestamp_minutes.is_some_and(|m| m < 0.0) {
                negative += 1;
                continue;
            }
            writer.serialize(WatchDataRow {
                march_id,
                user_id: &p.participant_id,
                timestamp: row.timestamp,
                timestamp_minutes: row.timestamp_minutes,
                heart_rate: row.heart_rate,
                steps: row.steps,
                speed_kmh: row.speed_kmh,
                cumulative_distance_km: row.cumulative_distance_km,
            })?;
        }
    }
    writer.flush()?;
    if negative > 0 {
        info!("Removed {negative} rows with negative timestamps (before march start)");
    }
    info!("Saved timeseries data to {}", path.display());

    let crossings = run.crossings();
    if crossings.is_empty() {
        info!("No GPS crossing times to save");
    } else {
        write_crossings(dir, &crossings)?;
    }
    Ok(())
}

pub fn write_crossings(dir: &Path, crossings: &BTreeMap<String, CrossingTime>) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create output directory {}", dir.display()))?;
    let path = dir.join(CROSSINGS_FILE);
    let file = std::fs::File::create(&path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(file, crossings)?;
    info!("Saved GPS crossing times for {} participants to {}", crossings.len(), path.display());
    Ok(path)
}
