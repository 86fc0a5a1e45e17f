//! Watch exports: one CSV per activity, with an optional GPX or TCX file of
//! the same stem next to it.
//!
//! Activities of one participant (`SM001_1.csv`, `SM001_2.csv`) are pieces of
//! the same march and are merged into one timeline. The GPS track anchors the
//! start/finish crossings, supplies speed and distance, and the CSV rows are
//! trimmed to the crossing window before anything is aggregated.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{Duration, NaiveDateTime, Timelike};
use log::{error, info, warn};
use rayon::prelude::*;
use walkdir::WalkDir;

use crate::config::WatchRunConfig;
use crate::data_loading::{self, parse_optional_f64, parse_timestamp};
use crate::error::{CadenceError, Result};
use crate::gps;
use crate::merge::{nearest, seconds};
use crate::{CrossingTime, GpsPoint, Timestamp};

/// Speeds above this are GPS jumps, not marching.
const MAX_SPEED_KMH: f64 = 15.0;
/// GPS points further than this from a CSV row are not attached to it.
const GPS_MATCH_TOLERANCE_S: f64 = 5.0;

const SUMMARY_COLUMNS: [&str; 4] = ["Name", "Sport", "Date", "Start time"];
const TIMESERIES_MARKERS: [&str; 4] = ["Sample rate", "Time", "HR (bpm)", "Speed (km/h)"];
const TIME_COLUMNS: [&str; 6] = ["Time", "time", "Timestamp", "timestamp", "DateTime", "datetime"];
const HR_COLUMNS: [&str; 7] = ["Heart Rate", "HR", "hr", "HeartRate", "heart_rate", "BPM", "bpm"];
const STEP_COLUMNS: [&str; 4] = ["Steps", "steps", "Step Count", "step_count"];

/// One watch reading after column normalisation.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WatchSample {
    pub timestamp: Timestamp,
    pub heart_rate: Option<f64>,
    /// Cumulative steps.
    pub steps: Option<f64>,
    pub speed_kmh: Option<f64>,
    pub cumulative_distance_km: Option<f64>,
}

impl WatchSample {
    fn at(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            ..Self::default()
        }
    }
}

/// The one-row activity summary some exporters put at the top of the CSV.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivitySummary {
    pub name: String,
    pub sport: String,
    pub start_time: Timestamp,
    pub duration_minutes: f64,
    pub avg_hr: Option<i64>,
    pub max_hr: Option<i64>,
    pub avg_cadence: Option<f64>,
    /// Average cadence times duration.
    pub estimated_steps: Option<i64>,
    pub avg_speed_kmh: Option<f64>,
    pub max_speed_kmh: Option<f64>,
    pub total_distance_km: Option<f64>,
    pub calories: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WatchCsv {
    pub samples: Vec<WatchSample>,
    pub summary: Option<ActivitySummary>,
}

/// The files of one recorded activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityFiles {
    pub activity_num: u32,
    pub csv: PathBuf,
    pub gpx: Option<PathBuf>,
    pub tcx: Option<PathBuf>,
}

/// Distance and speed at one GPS point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackSpeed {
    pub timestamp: Timestamp,
    pub cumulative_distance_km: f64,
    pub speed_kmh: f64,
}

/// One minute of the watch timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MinuteRow {
    pub timestamp: Timestamp,
    pub timestamp_minutes: Option<f64>,
    pub heart_rate: Option<f64>,
    pub steps: Option<f64>,
    pub speed_kmh: Option<f64>,
    pub cumulative_distance_km: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HealthMetrics {
    pub avg_hr: Option<i64>,
    pub max_hr: Option<i64>,
    pub total_steps: Option<i64>,
    pub march_duration_minutes: i64,
    /// Rows per expected 1 Hz sample.
    pub data_completeness: Option<f64>,
    pub avg_pace_kmh: Option<f64>,
    pub estimated_distance_km: Option<f64>,
    pub calories: Option<i64>,
}

/// Share of heart-rate samples per zone, in percent.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HrZones {
    pub very_light_percent: f64,
    pub light_percent: f64,
    pub moderate_percent: f64,
    pub intense_percent: f64,
    pub beast_mode_percent: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantWatch {
    pub participant_id: String,
    pub timeseries: Vec<MinuteRow>,
    pub metrics: HealthMetrics,
    pub hr_zones: Option<HrZones>,
    pub crossing: Option<CrossingTime>,
}

#[derive(Debug, Clone, Default)]
pub struct WatchRun {
    pub participants: Vec<ParticipantWatch>,
}

impl WatchRun {
    pub fn crossings(&self) -> BTreeMap<String, CrossingTime> {
        self.participants
            .iter()
            .filter_map(|p| Some((p.participant_id.clone(), p.crossing?)))
            .collect()
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

fn max(values: impl Iterator<Item = f64>) -> Option<f64> {
    values.fold(None, |m: Option<f64>, v| Some(m.map_or(v, |m| m.max(v))))
}

fn minutes_between(t: Timestamp, origin: Timestamp) -> f64 {
    (t - origin).num_milliseconds() as f64 / 60_000.0
}

fn sibling(csv: &Path, extension: &str) -> Option<PathBuf> {
    [extension.to_ascii_uppercase(), extension.to_ascii_lowercase()]
        .iter()
        .map(|ext| csv.with_extension(ext))
        .find(|path| path.is_file())
}

/// Groups the CSV exports in `dir` by participant, each with the GPX/TCX of
/// the same stem. Activities are ordered by their number.
pub fn find_activity_files(dir: &Path) -> BTreeMap<String, Vec<ActivityFiles>> {
    let mut participants: BTreeMap<String, Vec<ActivityFiles>> = BTreeMap::new();

    for entry in WalkDir::new(dir)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        let is_csv = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("csv"));
        if !entry.file_type().is_file() || !is_csv {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let (participant_id, activity_num) = match gps::split_activity_stem(stem) {
            Some((id, n)) => (id, n.unwrap_or(1)),
            None => (stem, 1),
        };

        participants
            .entry(participant_id.to_string())
            .or_default()
            .push(ActivityFiles {
                activity_num,
                csv: path.to_path_buf(),
                gpx: sibling(path, "gpx"),
                tcx: sibling(path, "tcx"),
            });
    }

    for activities in participants.values_mut() {
        activities.sort_by_key(|a| a.activity_num);
    }
    let total: usize = participants.values().map(Vec::len).sum();
    info!(
        "Found {} participants with {total} total activities",
        participants.len()
    );
    participants
}

/// Parses `HH:MM:SS[.fff]` into a duration.
fn parse_elapsed(s: &str) -> Option<Duration> {
    let mut parts = s.trim().split(':');
    let hours: i64 = parts.next()?.trim().parse().ok()?;
    let minutes: i64 = parts.next()?.trim().parse().ok()?;
    let seconds: f64 = parts.next().map_or(Some(0.0), |p| p.trim().parse().ok())?;
    if parts.next().is_some() {
        return None;
    }
    Some(
        Duration::hours(hours)
            + Duration::minutes(minutes)
            + Duration::milliseconds((seconds * 1000.0).round() as i64),
    )
}

fn position(headers: &[String], names: &[&str]) -> Option<usize> {
    names
        .iter()
        .find_map(|name| headers.iter().position(|h| h == name))
}

fn cell<'a>(row: &'a [String], col: Option<usize>) -> Option<&'a str> {
    col.and_then(|c| row.get(c)).map(String::as_str)
}

fn number(row: &[String], col: Option<usize>) -> Option<f64> {
    cell(row, col).and_then(parse_optional_f64)
}

fn parse_summary(path: &Path, headers: &[String], row: &[String]) -> Result<ActivitySummary> {
    let col = |name: &str| headers.iter().position(|h| h == name);
    let text = |name: &str| cell(row, col(name)).unwrap_or_default().trim().to_string();

    let start = format!("{} {}", text("Date"), text("Start time"));
    let start_time = ["%d.%m.%Y %H:%M:%S", "%d.%m.%Y %H:%M", "%d/%m/%Y %H:%M:%S"]
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(&start, f).ok())
        .or_else(|| parse_timestamp(&start).ok())
        .ok_or_else(|| CadenceError::InvalidTimestamp(start.clone()))?;

    let duration = text("Duration");
    let duration_minutes = match parse_elapsed(&duration) {
        Some(d) => d.num_milliseconds() as f64 / 60_000.0,
        None => {
            warn!("Could not parse duration {duration:?} in {}", path.display());
            0.0
        }
    };

    let avg_cadence = number(row, col("Average cadence (rpm)"));
    let estimated_steps = avg_cadence
        .filter(|_| duration_minutes > 0.0)
        .map(|cadence| (cadence * duration_minutes) as i64);
    if let (Some(steps), Some(cadence)) = (estimated_steps, avg_cadence) {
        info!(
            "Estimated {steps} steps from cadence {cadence} rpm over {duration_minutes:.1} minutes"
        );
    }

    let name = text("Name");
    let sport = text("Sport");
    Ok(ActivitySummary {
        name: if name.is_empty() { "Unknown".into() } else { name },
        sport: if sport.is_empty() { "Unknown".into() } else { sport },
        start_time,
        duration_minutes,
        avg_hr: number(row, col("Average heart rate (bpm)")).map(|v| v as i64),
        max_hr: number(row, col("Max heart rate")).map(|v| v as i64),
        avg_cadence,
        estimated_steps,
        avg_speed_kmh: number(row, col("Average speed (km/h)")),
        max_speed_kmh: number(row, col("Max speed (km/h)")),
        total_distance_km: number(row, col("Total distance (km)")),
        calories: number(row, col("Calories")).map(|v| v as i64),
    })
}

/// Samples below a summary: elapsed time from the activity start, with
/// cumulative steps integrated from cadence (steps per minute, 1 Hz rows).
fn parse_elapsed_samples(
    headers: &[String],
    rows: &[Vec<String>],
    start_time: Timestamp,
) -> Vec<WatchSample> {
    let time_col = position(headers, &["Time"]);
    let hr_col = position(headers, &["HR (bpm)"]);
    let speed_col = position(headers, &["Speed (km/h)"]);
    let cadence_col = position(headers, &["Cadence"]);

    let mut steps = 0.0;
    let mut samples = Vec::with_capacity(rows.len());
    for row in rows {
        let step = cadence_col.map(|_| {
            steps += number(row, cadence_col).unwrap_or(0.0) / 60.0;
            steps
        });
        let Some(elapsed) = cell(row, time_col).and_then(parse_elapsed) else {
            continue;
        };
        samples.push(WatchSample {
            heart_rate: number(row, hr_col),
            steps: step,
            speed_kmh: number(row, speed_col),
            ..WatchSample::at(start_time + elapsed)
        });
    }
    samples
}

fn parse_timestamped_samples(
    path: &Path,
    headers: &[String],
    rows: &[Vec<String>],
) -> Vec<WatchSample> {
    let Some(time_col) = position(headers, &TIME_COLUMNS) else {
        warn!(
            "No time column found in {}. Available columns: {headers:?}",
            path.display()
        );
        return Vec::new();
    };
    let hr_col = position(headers, &HR_COLUMNS);
    let steps_col = position(headers, &STEP_COLUMNS);

    rows.iter()
        .filter_map(|row| {
            let timestamp = parse_timestamp(cell(row, Some(time_col))?).ok()?;
            Some(WatchSample {
                heart_rate: number(row, hr_col),
                steps: number(row, steps_col),
                ..WatchSample::at(timestamp)
            })
        })
        .collect()
}

/// Reads a watch CSV in any of the three export layouts: plain time series,
/// a one-row summary, or a summary followed by its own time-series header.
pub fn read_watch_csv(path: &Path) -> Result<WatchCsv> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;
    let mut lines: Vec<Vec<String>> = Vec::new();
    for record in reader.records() {
        lines.push(record?.iter().map(|f| f.trim().to_string()).collect());
    }
    let Some((headers, rows)) = lines.split_first() else {
        warn!("Empty CSV file: {}", path.display());
        return Ok(WatchCsv::default());
    };

    if SUMMARY_COLUMNS.iter().all(|c| headers.iter().any(|h| h == c)) {
        let Some(first) = rows.first() else {
            warn!("Empty CSV file: {}", path.display());
            return Ok(WatchCsv::default());
        };
        let summary = parse_summary(path, headers, first)?;

        let combined = rows
            .get(1)
            .is_some_and(|row| row.iter().any(|v| TIMESERIES_MARKERS.contains(&v.as_str())));
        if combined {
            info!(
                "Detected combined format CSV (summary + timeseries): {}",
                path.display()
            );
            let samples = parse_elapsed_samples(&rows[1], &rows[2..], summary.start_time);
            info!(
                "Parsed {} time-series records from combined CSV {}",
                samples.len(),
                path.display()
            );
            return Ok(WatchCsv {
                samples,
                summary: Some(summary),
            });
        }

        info!("Detected summary-only format CSV: {}", path.display());
        return Ok(WatchCsv {
            samples: Vec::new(),
            summary: Some(summary),
        });
    }

    let samples = parse_timestamped_samples(path, headers, rows);
    info!(
        "Parsed {} time-series records from {}",
        samples.len(),
        path.display()
    );
    Ok(WatchCsv {
        samples,
        summary: None,
    })
}

/// Cumulative distance and point-to-point speed along a track, with speed
/// clipped to marching range.
pub fn track_speed(track: &[GpsPoint]) -> Vec<TrackSpeed> {
    let mut track = track.to_vec();
    track.sort_by_key(|p| p.timestamp);

    let mut cumulative_distance_km = 0.0;
    let mut speeds = Vec::with_capacity(track.len());
    for (i, point) in track.iter().enumerate() {
        let mut speed_kmh = 0.0;
        if let Some(prev) = i.checked_sub(1).map(|j| &track[j]) {
            let distance_km = gps::haversine_distance(prev.position, point.position) / 1000.0;
            let hours = (point.timestamp - prev.timestamp).num_milliseconds() as f64 / 3.6e6;
            cumulative_distance_km += distance_km;
            if hours > 0.0 {
                speed_kmh = distance_km / hours;
            }
        }
        speeds.push(TrackSpeed {
            timestamp: point.timestamp,
            cumulative_distance_km,
            speed_kmh: speed_kmh.clamp(0.0, MAX_SPEED_KMH),
        });
    }
    speeds
}

/// Attaches the nearest GPS speed and distance to each sample. Speeds from
/// the CSV win; GPS distance is only used when the CSV has none.
fn attach_track(samples: &mut [WatchSample], speeds: &[TrackSpeed]) {
    if speeds.is_empty() {
        return;
    }
    let keyed: Vec<(f64, &TrackSpeed)> = speeds.iter().map(|s| (seconds(s.timestamp), s)).collect();
    let csv_has_distance = samples.iter().any(|s| s.cumulative_distance_km.is_some());

    for sample in samples.iter_mut() {
        let hit = nearest(&keyed, seconds(sample.timestamp), GPS_MATCH_TOLERANCE_S);
        if sample.speed_kmh.is_none() {
            sample.speed_kmh = hit.map(|h| h.speed_kmh);
        }
        if !csv_has_distance {
            sample.cumulative_distance_km = hit.map(|h| h.cumulative_distance_km);
        }
    }
}

/// One-minute bins from the first to the last sample, empty minutes
/// included.
fn minute_bins<'a, T>(
    rows: &'a [T],
    timestamp: impl Fn(&T) -> Timestamp,
) -> Vec<(Timestamp, Vec<&'a T>)> {
    let floor = |t: Timestamp| {
        t.with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(t)
    };
    let (Some(first), Some(last)) = (
        rows.iter().map(&timestamp).min(),
        rows.iter().map(&timestamp).max(),
    ) else {
        return Vec::new();
    };
    let first = floor(first);
    let count = (floor(last) - first).num_minutes() as usize + 1;

    let mut bins: Vec<(Timestamp, Vec<&'a T>)> = (0..count)
        .map(|i| (first + Duration::minutes(i as i64), Vec::new()))
        .collect();
    for row in rows {
        let i = (floor(timestamp(row)) - first).num_minutes() as usize;
        bins[i].1.push(row);
    }
    bins
}

/// Fills interior gaps linearly and carries the last value forward.
fn interpolate(values: &mut [Option<f64>]) {
    let known: Vec<usize> = (0..values.len()).filter(|&i| values[i].is_some()).collect();
    for pair in known.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        let (Some(va), Some(vb)) = (values[a], values[b]) else {
            continue;
        };
        for i in a + 1..b {
            values[i] = Some(va + (vb - va) * (i - a) as f64 / (b - a) as f64);
        }
    }
    if let Some(&last) = known.last() {
        let value = values[last];
        for v in &mut values[last + 1..] {
            *v = value;
        }
    }
}

fn hr_zones(samples: &[WatchSample]) -> Option<HrZones> {
    let hr: Vec<f64> = samples.iter().filter_map(|s| s.heart_rate).collect();
    if hr.is_empty() {
        return None;
    }
    let share = |lo: f64, hi: f64| {
        let n = hr.iter().filter(|&&v| v >= lo && v < hi).count();
        round2(n as f64 / hr.len() as f64 * 100.0)
    };
    Some(HrZones {
        very_light_percent: share(f64::NEG_INFINITY, 100.0),
        light_percent: share(100.0, 120.0),
        moderate_percent: share(120.0, 140.0),
        intense_percent: share(140.0, 160.0),
        beast_mode_percent: share(160.0, f64::INFINITY),
    })
}

/// Minute timeline and metrics from time-series samples. Minutes count from
/// the march start, or from the first sample without one.
pub fn summarize_samples(
    participant_id: &str,
    mut samples: Vec<WatchSample>,
    track: &[GpsPoint],
    march_start: Option<Timestamp>,
) -> ParticipantWatch {
    samples.sort_by_key(|s| s.timestamp);
    attach_track(&mut samples, &track_speed(track));

    let origin = march_start.or_else(|| samples.first().map(|s| s.timestamp));
    let minutes = |t: Timestamp| origin.map_or(0.0, |o| minutes_between(t, o));
    let march_duration_minutes = max(samples.iter().map(|s| minutes(s.timestamp)))
        .map_or(0, |m| m.trunc() as i64);

    samples.retain(|s| minutes(s.timestamp) >= 0.0);
    if let Some(offset) = samples
        .iter()
        .filter_map(|s| s.cumulative_distance_km)
        .reduce(f64::min)
    {
        for s in &mut samples {
            s.cumulative_distance_km = s.cumulative_distance_km.map(|d| d - offset);
        }
    }

    let mut timeseries: Vec<MinuteRow> = minute_bins(&samples, |s| s.timestamp)
        .into_iter()
        .map(|(timestamp, rows)| MinuteRow {
            timestamp,
            timestamp_minutes: mean(rows.iter().map(|s| minutes(s.timestamp))),
            heart_rate: mean(rows.iter().filter_map(|s| s.heart_rate)),
            steps: max(rows.iter().filter_map(|s| s.steps)),
            speed_kmh: mean(rows.iter().filter_map(|s| s.speed_kmh)),
            cumulative_distance_km: max(rows.iter().filter_map(|s| s.cumulative_distance_km)),
        })
        .collect();
    let mut steps: Vec<Option<f64>> = timeseries.iter().map(|r| r.steps).collect();
    interpolate(&mut steps);
    for (row, steps) in timeseries.iter_mut().zip(steps) {
        row.steps = steps;
    }

    let has_speed = samples.iter().any(|s| s.speed_kmh.is_some());
    let metrics = HealthMetrics {
        avg_hr: mean(samples.iter().filter_map(|s| s.heart_rate)).map(|v| v as i64),
        max_hr: max(samples.iter().filter_map(|s| s.heart_rate)).map(|v| v as i64),
        total_steps: max(samples.iter().filter_map(|s| s.steps)).map(|v| v as i64),
        march_duration_minutes,
        data_completeness: (march_duration_minutes > 0)
            .then(|| round2(samples.len() as f64 / (march_duration_minutes * 60) as f64)),
        avg_pace_kmh: mean(samples.iter().filter_map(|s| s.speed_kmh))
            .filter(|_| has_speed)
            .map(round2),
        estimated_distance_km: max(samples.iter().filter_map(|s| s.cumulative_distance_km))
            .filter(|_| has_speed)
            .map(round2),
        calories: None,
    };

    ParticipantWatch {
        participant_id: participant_id.to_string(),
        timeseries,
        metrics,
        hr_zones: hr_zones(&samples),
        crossing: None,
    }
}

/// Metrics from an activity summary alone. With a GPS track, a minute
/// timeline is synthesised: GPS speed and distance, the average heart rate
/// throughout, and steps rising linearly to the estimated total.
pub fn summarize_summary(
    participant_id: &str,
    summary: &ActivitySummary,
    track: &[GpsPoint],
) -> ParticipantWatch {
    let speeds = track_speed(track);
    let mut timeseries: Vec<MinuteRow> = minute_bins(&speeds, |s| s.timestamp)
        .into_iter()
        .map(|(timestamp, rows)| MinuteRow {
            timestamp,
            timestamp_minutes: mean(
                rows.iter()
                    .map(|s| minutes_between(s.timestamp, summary.start_time)),
            ),
            heart_rate: summary.avg_hr.map(|hr| hr as f64),
            steps: None,
            speed_kmh: mean(rows.iter().map(|s| s.speed_kmh)),
            cumulative_distance_km: max(rows.iter().map(|s| s.cumulative_distance_km)),
        })
        .collect();

    if let Some(total) = summary.estimated_steps.filter(|&t| t != 0) {
        let n = timeseries.len();
        for (i, row) in timeseries.iter_mut().enumerate() {
            let fraction = if n > 1 { i as f64 / (n - 1) as f64 } else { 0.0 };
            row.steps = Some(total as f64 * fraction);
        }
    }

    ParticipantWatch {
        participant_id: participant_id.to_string(),
        timeseries,
        metrics: HealthMetrics {
            avg_hr: summary.avg_hr,
            max_hr: summary.max_hr,
            total_steps: summary.estimated_steps,
            march_duration_minutes: summary.duration_minutes.trunc() as i64,
            data_completeness: Some(1.0),
            avg_pace_kmh: summary.avg_speed_kmh,
            estimated_distance_km: summary.total_distance_km,
            calories: summary.calories,
        },
        hr_zones: None,
        crossing: None,
    }
}

/// GPS track of one activity: the GPX file, else the TCX trackpoints.
fn read_activity_track(participant_id: &str, files: &ActivityFiles) -> Vec<GpsPoint> {
    if let Some(gpx) = &files.gpx {
        match data_loading::read_gpx_track(gpx) {
            Ok(points) => return points,
            Err(e) => error!("Error parsing GPX file {}: {e}", gpx.display()),
        }
    }
    if let Some(tcx) = &files.tcx {
        match data_loading::read_tcx_activity(tcx) {
            Ok(Some(activity)) => {
                info!(
                    "{participant_id}: TCX {} with {} laps",
                    activity.sport,
                    activity.laps.len()
                );
                return activity.track();
            }
            Ok(None) => warn!("No activity found in {}", tcx.display()),
            Err(e) => error!("Error parsing TCX file {}: {e}", tcx.display()),
        }
    }
    Vec::new()
}

fn trim_logged<T>(
    participant_id: &str,
    what: &str,
    rows: Vec<T>,
    crossing: &CrossingTime,
    timestamp: impl Fn(&T) -> Timestamp,
) -> Vec<T> {
    let original_len = rows.len();
    let rows = gps::trim_by_crossing(rows, crossing, timestamp);
    if rows.len() < original_len {
        info!(
            "{participant_id}: Trimmed {what}: {original_len} -> {} rows ({} rows removed)",
            rows.len(),
            original_len - rows.len()
        );
    }
    rows
}

/// Merges all activities of one participant, trims them to the crossing
/// window and builds the minute timeline and metrics.
pub fn process_participant(
    participant_id: &str,
    activities: &[ActivityFiles],
    config: &WatchRunConfig,
) -> Option<ParticipantWatch> {
    if activities.len() > 1 {
        info!(
            "Processing {participant_id} - Merging {} activities into one",
            activities.len()
        );
    }

    let mut samples = Vec::new();
    let mut summary = None;
    let mut track = Vec::new();
    for files in activities {
        info!("  Parsing {participant_id} activity {}", files.activity_num);
        match read_watch_csv(&files.csv) {
            Ok(csv) => {
                samples.extend(csv.samples);
                summary = summary.or(csv.summary);
            }
            Err(e) => error!("Error parsing CSV file {}: {e}", files.csv.display()),
        }
        track.extend(read_activity_track(participant_id, files));
    }
    samples.sort_by_key(|s: &WatchSample| s.timestamp);
    track.sort_by_key(|p: &GpsPoint| p.timestamp);

    let wants_crossing = config.crossing.start.is_some() || config.crossing.end.is_some();
    let crossing = if wants_crossing && !track.is_empty() {
        info!("{participant_id}: Finding GPS crossing times...");
        gps::find_crossing_times(participant_id, &track, &config.crossing)
    } else {
        None
    };
    if let Some(crossing) = &crossing {
        track = trim_logged(participant_id, "GPS data", track, crossing, |p| {
            p.timestamp
        });
        samples = trim_logged(participant_id, "CSV data", samples, crossing, |s| {
            s.timestamp
        });
    }

    let mut result = if !samples.is_empty() {
        summarize_samples(participant_id, samples, &track, config.march_start)
    } else if let Some(summary) = &summary {
        info!("Processing with summary data only for {participant_id}");
        summarize_summary(participant_id, summary, &track)
    } else {
        warn!("No valid data for participant {participant_id}");
        return None;
    };
    result.crossing = crossing;
    Some(result)
}

/// Processes every participant found in the configured watch directory.
pub fn run(config: &WatchRunConfig) -> Result<WatchRun> {
    if !config.data_dir.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("data directory not found: {}", config.data_dir.display()),
        )
        .into());
    }

    let participants: Vec<(String, Vec<ActivityFiles>)> =
        find_activity_files(&config.data_dir).into_iter().collect();
    let results: Vec<ParticipantWatch> = participants
        .par_iter()
        .filter_map(|(id, activities)| process_participant(id, activities, config))
        .collect();

    info!("Successfully processed {} participants", results.len());
    Ok(WatchRun {
        participants: results,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CrossingConfig;
    use crate::Coordinate;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32, s: u32) -> Timestamp {
        NaiveDate::from_ymd_opt(2025, 3, 15)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn point(t: Timestamp, latitude: f64) -> GpsPoint {
        GpsPoint {
            timestamp: t,
            position: Coordinate::new(latitude, 7.4474),
        }
    }

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn parses_elapsed_times() {
        assert_eq!(parse_elapsed("00:01:30"), Some(Duration::seconds(90)));
        assert_eq!(parse_elapsed("01:00:00.5"), Some(Duration::milliseconds(3_600_500)));
        assert_eq!(parse_elapsed("abc"), None);
    }

    #[test]
    fn reads_timeseries_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "SM001.csv",
            "Timestamp,Heart Rate,Steps\n\
             2025-03-15 08:00:00,98,10\n\
             not a time,99,11\n\
             2025-03-15 08:00:01,,12\n",
        );
        let csv = read_watch_csv(&path).unwrap();
        assert!(csv.summary.is_none());
        assert_eq!(csv.samples.len(), 2);
        assert_eq!(csv.samples[0].heart_rate, Some(98.0));
        assert_eq!(csv.samples[1].heart_rate, None);
        assert_eq!(csv.samples[1].steps, Some(12.0));
    }

    #[test]
    fn reads_summary_only_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "SM001.csv",
            "Name,Sport,Date,Start time,Duration,Average heart rate (bpm),Average cadence (rpm),Total distance (km)\n\
             Tester,WALKING,15.03.2025,08:00:00,02:00:00,121.6,110,11.5\n",
        );
        let csv = read_watch_csv(&path).unwrap();
        assert!(csv.samples.is_empty());
        let summary = csv.summary.unwrap();
        assert_eq!(summary.start_time, at(8, 0, 0));
        assert_eq!(summary.duration_minutes, 120.0);
        assert_eq!(summary.avg_hr, Some(121));
        assert_eq!(summary.estimated_steps, Some(13_200));
        assert_eq!(summary.total_distance_km, Some(11.5));
    }

    #[test]
    fn reads_combined_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "SM001.csv",
            "Name,Sport,Date,Start time,Duration\n\
             Tester,WALKING,15.03.2025,08:00:00,00:00:03\n\
             Sample rate,Time,HR (bpm),Speed (km/h),Cadence\n\
             1,00:00:00,100,5.0,120\n\
             1,00:00:01,101,5.2,120\n\
             1,00:00:02,102,,60\n",
        );
        let csv = read_watch_csv(&path).unwrap();
        assert!(csv.summary.is_some());
        assert_eq!(csv.samples.len(), 3);
        assert_eq!(csv.samples[2].timestamp, at(8, 0, 2));
        assert_eq!(csv.samples[1].heart_rate, Some(101.0));
        assert_eq!(csv.samples[2].speed_kmh, None);
        // 2 + 2 + 1 steps from cadence.
        assert_eq!(csv.samples[2].steps, Some(5.0));
    }

    #[test]
    fn pairs_exports_by_stem() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["SM001_2.csv", "SM001_1.CSV", "SM001_1.gpx", "SM002.csv", "SM002.TCX"] {
            write(dir.path(), name, "");
        }
        let found = find_activity_files(dir.path());
        assert_eq!(found.len(), 2);

        let sm001 = &found["SM001"];
        assert_eq!(sm001.len(), 2);
        assert_eq!(sm001[0].activity_num, 1);
        assert_eq!(sm001[0].gpx, Some(dir.path().join("SM001_1.gpx")));
        assert_eq!(sm001[1].activity_num, 2);
        assert_eq!(sm001[1].gpx, None);

        assert_eq!(found["SM002"][0].tcx, Some(dir.path().join("SM002.TCX")));
    }

    #[test]
    fn speed_and_distance_from_track() {
        // 0.001 degree of latitude is about 111 m.
        let track = vec![
            point(at(8, 1, 0), 46.001),
            point(at(8, 0, 0), 46.000),
            point(at(8, 1, 0), 46.001),
            point(at(8, 1, 10), 46.011),
        ];
        let speeds = track_speed(&track);
        assert_eq!(speeds[0].speed_kmh, 0.0);
        assert!((speeds[1].cumulative_distance_km - 0.1112).abs() < 1e-3);
        assert!((speeds[1].speed_kmh - 6.67).abs() < 0.01, "{}", speeds[1].speed_kmh);
        // Zero elapsed time adds distance but no speed.
        assert_eq!(speeds[2].speed_kmh, 0.0);
        // 1.1 km in 10 s is clipped.
        assert_eq!(speeds[3].speed_kmh, MAX_SPEED_KMH);
    }

    #[test]
    fn interpolates_interior_gaps_and_carries_last() {
        let mut values = vec![None, Some(0.0), None, None, Some(30.0), None];
        interpolate(&mut values);
        assert_eq!(
            values,
            vec![None, Some(0.0), Some(10.0), Some(20.0), Some(30.0), Some(30.0)]
        );
    }

    #[test]
    fn minute_timeline_from_samples() {
        let samples: Vec<WatchSample> = (0..180)
            .filter(|s| !(60..120).contains(s))
            .map(|s| WatchSample {
                heart_rate: Some(if s < 60 { 110.0 } else { 150.0 }),
                steps: Some(s as f64),
                ..WatchSample::at(at(8, 0, 0) + Duration::seconds(s))
            })
            .collect();
        let track: Vec<GpsPoint> = (0..=3)
            .map(|m| point(at(8, m, 0), 46.0 + 0.001 * m as f64))
            .collect();

        let result = summarize_samples("SM001", samples, &track, Some(at(7, 59, 0)));
        assert_eq!(result.timeseries.len(), 3);
        assert_eq!(result.timeseries[0].heart_rate, Some(110.0));
        // Empty middle minute: steps interpolated, heart rate missing.
        assert_eq!(result.timeseries[1].heart_rate, None);
        assert_eq!(result.timeseries[1].steps, Some(119.0));
        assert_eq!(result.timeseries[2].steps, Some(179.0));
        assert!((result.timeseries[0].timestamp_minutes.unwrap() - 1.49).abs() < 0.01);

        assert_eq!(result.metrics.avg_hr, Some(130));
        assert_eq!(result.metrics.max_hr, Some(150));
        assert_eq!(result.metrics.total_steps, Some(179));
        assert_eq!(result.metrics.march_duration_minutes, 3);
        assert_eq!(result.metrics.data_completeness, Some(0.67));
        // Rows at 08:02:55 and later sit on the 08:03 point, three legs out.
        assert_eq!(result.metrics.estimated_distance_km, Some(0.33));

        let zones = result.hr_zones.unwrap();
        assert_eq!(zones.light_percent, 50.0);
        assert_eq!(zones.intense_percent, 50.0);
    }

    #[test]
    fn samples_before_march_start_are_dropped() {
        let samples: Vec<WatchSample> = (0..4)
            .map(|m| WatchSample {
                heart_rate: Some(100.0 + m as f64),
                ..WatchSample::at(at(8, m, 0))
            })
            .collect();
        let result = summarize_samples("SM001", samples, &[], Some(at(8, 2, 0)));
        assert_eq!(result.timeseries.len(), 2);
        assert_eq!(result.timeseries[0].timestamp_minutes, Some(0.0));
        assert_eq!(result.metrics.avg_hr, Some(102));
    }

    #[test]
    fn summary_with_track_gets_linear_steps() {
        let summary = ActivitySummary {
            name: "Tester".into(),
            sport: "WALKING".into(),
            start_time: at(8, 0, 0),
            duration_minutes: 2.0,
            avg_hr: Some(120),
            max_hr: Some(150),
            avg_cadence: Some(100.0),
            estimated_steps: Some(200),
            avg_speed_kmh: Some(5.0),
            max_speed_kmh: None,
            total_distance_km: Some(0.2),
            calories: Some(80),
        };
        let track: Vec<GpsPoint> = (0..=2)
            .map(|m| point(at(8, m, 0), 46.0 + 0.001 * m as f64))
            .collect();

        let result = summarize_summary("SM001", &summary, &track);
        let steps: Vec<_> = result.timeseries.iter().map(|r| r.steps).collect();
        assert_eq!(steps, vec![Some(0.0), Some(100.0), Some(200.0)]);
        assert!(result.timeseries.iter().all(|r| r.heart_rate == Some(120.0)));
        assert_eq!(result.metrics.total_steps, Some(200));
        assert_eq!(result.metrics.data_completeness, Some(1.0));
        assert_eq!(result.metrics.calories, Some(80));
    }

    #[test]
    fn activities_are_merged_and_trimmed_to_crossings() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = String::from("timestamp,heart_rate,steps\n");
        let mut second = first.clone();
        for m in 0..10 {
            let body = if m < 5 { &mut first } else { &mut second };
            body.push_str(&format!("2025-03-15 08:{m:02}:00,{},{}\n", 100 + m, m * 100));
        }
        write(dir.path(), "SM001_1.csv", &first);
        write(dir.path(), "SM001_2.csv", &second);

        // Two GPX files; the banner is passed at 08:02 and again at 08:07.
        let gpx_file = |minutes: &[(u32, f64)]| {
            let body: String = minutes
                .iter()
                .map(|(m, lat)| {
                    format!(
                        r#"<trkpt lat="{lat}" lon="7.4474"><time>2025-03-15T08:{m:02}:00Z</time></trkpt>"#
                    )
                })
                .collect();
            format!(
                r#"<?xml version="1.0" encoding="UTF-8"?>
<gpx version="1.1" creator="test" xmlns="http://www.topografix.com/GPX/1/1"><trk><trkseg>{body}</trkseg></trk></gpx>"#
            )
        };
        write(
            dir.path(),
            "SM001_1.gpx",
            &gpx_file(&[(0, 46.9460), (2, 46.94802), (4, 46.9550)]),
        );
        write(
            dir.path(),
            "SM001_2.gpx",
            &gpx_file(&[(5, 46.9600), (7, 46.94801), (9, 46.9440)]),
        );

        let mut config = WatchRunConfig::new(3, dir.path());
        config.crossing = CrossingConfig {
            start: Some(Coordinate::new(46.9480, 7.4474)),
            end: Some(Coordinate::new(46.9480, 7.4474)),
            tolerance_m: 50.0,
        };
        let run = run(&config).unwrap();
        assert_eq!(run.participants.len(), 1);

        let sm001 = &run.participants[0];
        assert_eq!(
            sm001.crossing,
            Some(CrossingTime {
                start: Some(at(8, 2, 0)),
                end: Some(at(8, 7, 0)),
            })
        );
        assert_eq!(sm001.timeseries.len(), 6);
        assert_eq!(sm001.timeseries[0].timestamp, at(8, 2, 0));
        assert_eq!(sm001.metrics.total_steps, Some(700));
        assert_eq!(run.crossings().len(), 1);
    }

    #[test]
    fn tcx_track_stands_in_for_gpx() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "SM003.tcx",
            r#"<?xml version="1.0" encoding="UTF-8"?>
<TrainingCenterDatabase xmlns="http://www.garmin.com/xmlschemas/TrainingCenterDatabase/v2">
  <Activities>
    <Activity Sport="Other">
      <Id>2025-03-15T08:00:00Z</Id>
      <Lap StartTime="2025-03-15T08:00:00Z">
        <TotalTimeSeconds>120</TotalTimeSeconds>
        <DistanceMeters>222.4</DistanceMeters>
        <Calories>15</Calories>
        <AverageHeartRateBpm><Value>118</Value></AverageHeartRateBpm>
        <MaximumHeartRateBpm><Value>131</Value></MaximumHeartRateBpm>
        <Track>
          <Trackpoint>
            <Time>2025-03-15T08:00:00Z</Time>
            <Position><LatitudeDegrees>46.000</LatitudeDegrees><LongitudeDegrees>7.4474</LongitudeDegrees></Position>
            <HeartRateBpm><Value>110</Value></HeartRateBpm>
          </Trackpoint>
          <Trackpoint>
            <Time>2025-03-15T08:01:00Z</Time>
            <HeartRateBpm><Value>120</Value></HeartRateBpm>
          </Trackpoint>
          <Trackpoint>
            <Time>2025-03-15T08:02:00Z</Time>
            <Position><LatitudeDegrees>46.002</LatitudeDegrees><LongitudeDegrees>7.4474</LongitudeDegrees></Position>
            <DistanceMeters>222.4</DistanceMeters>
          </Trackpoint>
        </Track>
      </Lap>
    </Activity>
  </Activities>
</TrainingCenterDatabase>"#,
        );
        let activity = data_loading::read_tcx_activity(&dir.path().join("SM003.tcx"))
            .unwrap()
            .unwrap();
        assert_eq!(activity.sport, "Other");
        assert_eq!(activity.laps.len(), 1);
        assert_eq!(activity.laps[0].start_time, Some(at(8, 0, 0)));
        assert_eq!(activity.laps[0].total_time_seconds, 120.0);
        assert_eq!(activity.laps[0].distance_meters, 222.4);
        assert_eq!(activity.laps[0].avg_hr, 118);
        assert_eq!(activity.laps[0].max_hr, 131);
        assert_eq!(activity.trackpoints.len(), 3);
        assert_eq!(activity.trackpoints[1].heart_rate, Some(120.0));
        assert_eq!(activity.trackpoints[2].distance_m, Some(222.4));

        let track = activity.track();
        assert_eq!(track.len(), 2);
        assert_eq!(track[1].position, Coordinate::new(46.002, 7.4474));

        write(
            dir.path(),
            "SM003.csv",
            "timestamp,heart_rate\n2025-03-15 08:00:00,110\n2025-03-15 08:02:00,125\n",
        );
        let found = find_activity_files(dir.path());
        let config = WatchRunConfig::new(3, dir.path());
        let result = process_participant("SM003", &found["SM003"], &config).unwrap();
        let last = result.timeseries.last().unwrap();
        assert!((last.cumulative_distance_km.unwrap() - 0.2224).abs() < 1e-3);
    }
}
