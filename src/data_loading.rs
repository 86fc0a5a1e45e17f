use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use log::debug;
use polars::prelude::*;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{CadenceError, Result};
use crate::{Coordinate, CrossingTime, GpsPoint, Sample, Timestamp};

/// Candidate names of the time column in accelerometer exports. Parquet
/// files written from an indexed frame keep the index under the last name.
const TIME_COLUMNS: [&str; 4] = ["Time", "time", "timestamp", "__index_level_0__"];

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// Parses the timestamp spellings found across the exports. Offsets are
/// dropped and the wall-clock time kept.
pub fn parse_timestamp(s: &str) -> Result<Timestamp> {
    let s = s.trim();
    for format in NAIVE_FORMATS {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(t);
        }
    }
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.naive_local());
    }
    if let Ok(t) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Ok(t.naive_local());
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(t) = d.and_hms_opt(0, 0, 0) {
            return Ok(t);
        }
    }
    Err(CadenceError::InvalidTimestamp(s.to_string()))
}

/// Timestamps written as `YYYY-MM-DD HH:MM:SS[.fff]`.
pub mod timestamp {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::Timestamp;

    pub const FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

    pub fn serialize<S: Serializer>(t: &Timestamp, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&t.format(FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Timestamp, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_timestamp(&raw).map_err(serde::de::Error::custom)
    }
}

/// Optional ISO 8601 timestamps, as used in the crossing file.
pub mod optional_timestamp {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::Timestamp;

    pub const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

    pub fn serialize<S: Serializer>(t: &Option<Timestamp>, s: S) -> Result<S::Ok, S::Error> {
        match t {
            Some(t) => s.collect_str(&t.format(FORMAT)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Timestamp>, D::Error> {
        match Option::<String>::deserialize(d)? {
            Some(raw) if !raw.trim().is_empty() => super::parse_timestamp(&raw)
                .map(Some)
                .map_err(serde::de::Error::custom),
            _ => Ok(None),
        }
    }
}

/// A CSV file kept as text, for tables whose columns are passed through.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CsvTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl CsvTable {
    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }
}

pub fn read_table(path: &Path) -> Result<CsvTable> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let headers = reader.headers()?.iter().map(str::to_string).collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        rows.push(record?.iter().map(str::to_string).collect());
    }

    Ok(CsvTable { headers, rows })
}

/// Reads every row of a CSV file with a header into `T`.
pub fn read_records<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut records = Vec::new();
    for record in reader.deserialize() {
        records.push(record?);
    }
    Ok(records)
}

/// Empty cells and pandas' `NaN` both read as missing.
pub fn parse_optional_f64(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() || s.eq_ignore_ascii_case("nan") {
        return None;
    }
    s.parse().ok()
}

/// Reads an accelerometer recording, choosing the reader by extension.
pub fn read_acceleration(path: &Path) -> Result<Vec<Sample>> {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("csv") => read_acceleration_csv(path),
        _ => read_acceleration_parquet(path),
    }
}

#[derive(Debug, Deserialize)]
struct AccRecord {
    #[serde(alias = "Time", alias = "time", with = "timestamp")]
    timestamp: Timestamp,
    #[serde(rename = "X")]
    x: f32,
    #[serde(rename = "Y")]
    y: f32,
    #[serde(rename = "Z")]
    z: f32,
}

pub fn read_acceleration_csv(path: &Path) -> Result<Vec<Sample>> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();
    for column in ["X", "Y", "Z"] {
        if !headers.iter().any(|h| h == column) {
            return Err(missing(path, column));
        }
    }

    let mut samples = Vec::new();
    for record in reader.deserialize::<AccRecord>() {
        let r = record?;
        samples.push(Sample {
            timestamp: r.timestamp,
            x: r.x,
            y: r.y,
            z: r.z,
        });
    }
    debug!("Read {} samples from {}", samples.len(), path.display());
    Ok(samples)
}

pub fn read_acceleration_parquet(path: &Path) -> Result<Vec<Sample>> {
    let df = LazyFrame::scan_parquet(path, ScanArgsParquet::default())?.collect()?;

    let time_name = TIME_COLUMNS
        .iter()
        .find(|name| df.column(name).is_ok())
        .ok_or_else(|| missing(path, "Time"))?;
    let timestamps = time_column(path, df.column(time_name)?.as_materialized_series())?;

    let mut axes = Vec::with_capacity(3);
    for name in ["X", "Y", "Z"] {
        let column = df.column(name).map_err(|_| missing(path, name))?;
        let values: Vec<f32> = column
            .as_materialized_series()
            .cast(&DataType::Float64)?
            .f64()?
            .into_iter()
            .map(|v| v.map_or(f32::NAN, |v| v as f32))
            .collect();
        axes.push(values);
    }

    let samples: Vec<Sample> = timestamps
        .into_iter()
        .enumerate()
        .map(|(i, timestamp)| Sample {
            timestamp,
            x: axes[0][i],
            y: axes[1][i],
            z: axes[2][i],
        })
        .collect();
    debug!("Read {} samples from {}", samples.len(), path.display());
    Ok(samples)
}

fn time_column(path: &Path, series: &Series) -> Result<Vec<Timestamp>> {
    if series.dtype() == &DataType::String {
        return series
            .str()?
            .into_iter()
            .map(|v| {
                v.ok_or_else(|| missing(path, series.name().as_str()))
                    .and_then(parse_timestamp)
            })
            .collect();
    }

    let nanos = series
        .cast(&DataType::Datetime(TimeUnit::Nanoseconds, None))?
        .cast(&DataType::Int64)?;
    nanos
        .i64()?
        .into_iter()
        .map(|v| {
            v.map(|ns| DateTime::from_timestamp_nanos(ns).naive_utc())
                .ok_or_else(|| {
                    CadenceError::InvalidTimestamp(format!("null in {}", path.display()))
                })
        })
        .collect()
}

fn missing(path: &Path, column: &str) -> CadenceError {
    CadenceError::MissingColumn {
        path: path.to_path_buf(),
        column: column.to_string(),
    }
}

/// Reads every timestamped track point of a GPX file.
pub fn read_gpx_track(path: &Path) -> Result<Vec<GpsPoint>> {
    let reader = BufReader::new(File::open(path)?);
    let gpx = gpx::read(reader)?;

    let mut points = Vec::new();
    for track in &gpx.tracks {
        for segment in &track.segments {
            for waypoint in &segment.points {
                let Some(time) = &waypoint.time else {
                    continue;
                };
                let timestamp = parse_timestamp(&time.format()?)?;
                let point = waypoint.point();
                points.push(GpsPoint {
                    timestamp,
                    position: Coordinate::new(point.y(), point.x()),
                });
            }
        }
    }
    debug!("Parsed {} GPS points from {}", points.len(), path.display());
    Ok(points)
}

/// One lap of a Training Center XML activity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TcxLap {
    pub start_time: Option<Timestamp>,
    pub total_time_seconds: f64,
    pub distance_meters: f64,
    pub calories: i64,
    pub avg_hr: i64,
    pub max_hr: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TcxTrackpoint {
    pub timestamp: Option<Timestamp>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub heart_rate: Option<f64>,
    pub distance_m: Option<f64>,
}

impl TcxTrackpoint {
    pub fn gps_point(&self) -> Option<GpsPoint> {
        Some(GpsPoint {
            timestamp: self.timestamp?,
            position: Coordinate::new(self.latitude?, self.longitude?),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TcxActivity {
    pub sport: String,
    pub laps: Vec<TcxLap>,
    pub trackpoints: Vec<TcxTrackpoint>,
}

impl TcxActivity {
    /// Trackpoints that carry both a time and a position.
    pub fn track(&self) -> Vec<GpsPoint> {
        self.trackpoints
            .iter()
            .filter_map(TcxTrackpoint::gps_point)
            .collect()
    }
}

/// Reads the first activity of a TCX file. `Ok(None)` when the file holds
/// no activity. Elements are matched by local name, so the namespace prefix
/// used by the exporter does not matter.
pub fn read_tcx_activity(path: &Path) -> Result<Option<TcxActivity>> {
    use xml::reader::{EventReader, XmlEvent};

    let parser = EventReader::new(BufReader::new(File::open(path)?));
    let mut stack: Vec<String> = Vec::new();
    let mut activity: Option<TcxActivity> = None;
    let mut trackpoint: Option<TcxTrackpoint> = None;
    let mut finished = false;

    for event in parser {
        match event? {
            XmlEvent::StartElement {
                name, attributes, ..
            } => {
                let attr = |key: &str| {
                    attributes
                        .iter()
                        .find(|a| a.name.local_name == key)
                        .map(|a| a.value.clone())
                };
                match name.local_name.as_str() {
                    "Activity" if activity.is_none() && !finished => {
                        activity = Some(TcxActivity {
                            sport: attr("Sport").unwrap_or_else(|| "Unknown".to_string()),
                            ..TcxActivity::default()
                        });
                    }
                    "Lap" => {
                        if let Some(activity) = activity.as_mut().filter(|_| !finished) {
                            activity.laps.push(TcxLap {
                                start_time: attr("StartTime")
                                    .and_then(|t| parse_timestamp(&t).ok()),
                                ..TcxLap::default()
                            });
                        }
                    }
                    "Trackpoint" => trackpoint = Some(TcxTrackpoint::default()),
                    _ => {}
                }
                stack.push(name.local_name);
            }
            XmlEvent::EndElement { name } => {
                stack.pop();
                match name.local_name.as_str() {
                    "Trackpoint" => {
                        let point = trackpoint.take();
                        if let (Some(point), Some(activity)) = (point, activity.as_mut()) {
                            if !finished {
                                activity.trackpoints.push(point);
                            }
                        }
                    }
                    "Activity" if activity.is_some() => finished = true,
                    _ => {}
                }
            }
            XmlEvent::Characters(text) if !finished => {
                let Some(activity) = activity.as_mut() else {
                    continue;
                };
                let text = text.trim();
                let n = stack.len();
                let parent = |up: usize| n.checked_sub(up + 1).map(|i| stack[i].as_str());
                let number = || text.parse::<f64>().ok();

                if let Some(point) = trackpoint.as_mut() {
                    match (parent(1), parent(0)) {
                        (Some("Trackpoint"), Some("Time")) => {
                            point.timestamp = parse_timestamp(text).ok()
                        }
                        (Some("Position"), Some("LatitudeDegrees")) => point.latitude = number(),
                        (Some("Position"), Some("LongitudeDegrees")) => point.longitude = number(),
                        (Some("HeartRateBpm"), Some("Value")) => point.heart_rate = number(),
                        (Some("Trackpoint"), Some("DistanceMeters")) => point.distance_m = number(),
                        _ => {}
                    }
                    continue;
                }

                let Some(lap) = activity.laps.last_mut() else {
                    continue;
                };
                let value = number().unwrap_or(0.0);
                match (parent(2), parent(1), parent(0)) {
                    (_, Some("Lap"), Some("TotalTimeSeconds")) => lap.total_time_seconds = value,
                    (_, Some("Lap"), Some("DistanceMeters")) => lap.distance_meters = value,
                    (_, Some("Lap"), Some("Calories")) => lap.calories = value as i64,
                    (Some("Lap"), Some("AverageHeartRateBpm"), Some("Value")) => {
                        lap.avg_hr = value as i64
                    }
                    (Some("Lap"), Some("MaximumHeartRateBpm"), Some("Value")) => {
                        lap.max_hr = value as i64
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    if let Some(activity) = &activity {
        debug!(
            "Parsed TCX file {}: {} with {} laps and {} trackpoints",
            path.display(),
            activity.sport,
            activity.laps.len(),
            activity.trackpoints.len()
        );
    }
    Ok(activity)
}

/// Reads `{participant: {"start": ..., "end": ...}}`.
pub fn read_crossing_times(path: &Path) -> Result<BTreeMap<String, CrossingTime>> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn at(h: u32, m: u32, s: u32) -> Timestamp {
        NaiveDate::from_ymd_opt(2025, 3, 15)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn parses_export_spellings() {
        assert_eq!(parse_timestamp("2025-03-15 08:05:00").unwrap(), at(8, 5, 0));
        assert_eq!(parse_timestamp("2025-03-15T08:05:00").unwrap(), at(8, 5, 0));
        assert_eq!(parse_timestamp("2025-03-15T08:05:00Z").unwrap(), at(8, 5, 0));
        assert_eq!(
            parse_timestamp("2025-03-15T08:05:00+01:00").unwrap(),
            at(8, 5, 0)
        );
        assert_eq!(parse_timestamp("2025-03-15").unwrap(), at(0, 0, 0));
        assert_eq!(
            parse_timestamp("2025-03-15 08:05:00.250").unwrap(),
            at(8, 5, 0) + chrono::Duration::milliseconds(250)
        );
        assert!(matches!(
            parse_timestamp("yesterday"),
            Err(CadenceError::InvalidTimestamp(_))
        ));
    }

    #[test]
    fn optional_numbers() {
        assert_eq!(parse_optional_f64(" 1.5 "), Some(1.5));
        assert_eq!(parse_optional_f64(""), None);
        assert_eq!(parse_optional_f64("NaN"), None);
    }

    #[test]
    fn crossing_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gps_crossing_times.json");
        let mut file = File::create(&path).unwrap();
        write!(
            file,
            r#"{{"SM001": {{"start": "2025-03-15T08:05:00", "end": "2025-03-15T12:30:00"}},
                "SM002": {{"start": "2025-03-15T08:07:00"}}}}"#
        )
        .unwrap();
        drop(file);

        let crossings = read_crossing_times(&path).unwrap();
        assert_eq!(crossings["SM001"].start, Some(at(8, 5, 0)));
        assert_eq!(crossings["SM001"].end, Some(at(12, 30, 0)));
        assert_eq!(crossings["SM002"].end, None);

        let json = serde_json::to_string(&crossings["SM002"]).unwrap();
        assert_eq!(json, r#"{"start":"2025-03-15T08:07:00"}"#);
    }

    #[test]
    fn acceleration_csv_requires_axes() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("acc.csv");
        std::fs::write(
            &good,
            "Time,X,Y,Z\n2025-03-15 08:00:00,1,2,3\n2025-03-15 08:00:00.5,4,5,6\n",
        )
        .unwrap();
        let samples = read_acceleration(&good).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[1].z, 6.0);
        assert_eq!(samples[0].timestamp, at(8, 0, 0));

        let bad = dir.path().join("bad.csv");
        std::fs::write(&bad, "Time,X,Y\n2025-03-15 08:00:00,1,2\n").unwrap();
        match read_acceleration(&bad) {
            Err(CadenceError::MissingColumn { column, .. }) => assert_eq!(column, "Z"),
            other => panic!("expected missing column, got {other:?}"),
        }
    }

    #[test]
    fn reads_gpx_points() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("SM001.gpx");
        std::fs::write(
            &path,
            r#"<?xml version="1.0" encoding="UTF-8"?>
<gpx version="1.1" creator="test" xmlns="http://www.topografix.com/GPX/1/1">
  <trk><trkseg>
    <trkpt lat="46.9480" lon="7.4474"><time>2025-03-15T08:00:00Z</time></trkpt>
    <trkpt lat="46.9490" lon="7.4480"><time>2025-03-15T08:00:10Z</time></trkpt>
  </trkseg></trk>
</gpx>"#,
        )
        .unwrap();
        let points = read_gpx_track(&path).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].timestamp, at(8, 0, 0));
        assert!((points[1].position.latitude - 46.949).abs() < 1e-9);
        assert!((points[1].position.longitude - 7.448).abs() < 1e-9);
    }
}
