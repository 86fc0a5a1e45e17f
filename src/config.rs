use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::Duration;
use clap::{Parser, Subcommand};

use crate::{Coordinate, CrossingTime, Timestamp};

/// Sampling rate of the accelerometers in this population of devices.
pub const SAMPLE_RATE_HZ: f32 = 52.0;

/// Settings for the per-window cadence estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CadenceConfig {
    pub sample_rate: f32,
    pub window_seconds: u32,
    /// Order of the gravity-removal high-pass.
    pub highpass_order: usize,
    /// Order of the low-pass applied before cycle counting.
    pub lowpass_order: usize,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE_HZ,
            window_seconds: 8,
            highpass_order: 2,
            lowpass_order: 2,
        }
    }
}

impl CadenceConfig {
    /// Windows with fewer samples than this carry no estimate.
    pub fn min_window_samples(&self) -> usize {
        (3.0 * self.sample_rate) as usize
    }
}

/// Settings for one batch run over a march's accelerometer directory.
#[derive(Debug, Clone)]
pub struct StepRunConfig {
    pub march_id: i64,
    pub data_dir: PathBuf,
    pub cadence: CadenceConfig,
    /// Fixed skew between the accelerometer clock and the watch clock.
    pub clock_offset: Duration,
    pub march_start: Option<Timestamp>,
    pub crossings: BTreeMap<String, CrossingTime>,
}

impl StepRunConfig {
    pub fn new(march_id: i64, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            march_id,
            data_dir: data_dir.into(),
            cadence: CadenceConfig::default(),
            clock_offset: Duration::hours(1),
            march_start: None,
            crossings: BTreeMap::new(),
        }
    }
}

/// Start and finish banner positions used to anchor GPS tracks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrossingConfig {
    pub start: Option<Coordinate>,
    pub end: Option<Coordinate>,
    pub tolerance_m: f64,
}

impl Default for CrossingConfig {
    fn default() -> Self {
        Self {
            start: None,
            end: None,
            tolerance_m: 50.0,
        }
    }
}

/// Settings for one pass over a watch export directory.
#[derive(Debug, Clone)]
pub struct WatchRunConfig {
    pub march_id: i64,
    pub data_dir: PathBuf,
    /// Origin of `timestamp_minutes`; rows before it are dropped.
    pub march_start: Option<Timestamp>,
    pub crossing: CrossingConfig,
}

impl WatchRunConfig {
    pub fn new(march_id: i64, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            march_id,
            data_dir: data_dir.into(),
            march_start: None,
            crossing: CrossingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeKey {
    /// Wall-clock timestamp, tolerance in seconds.
    Timestamp,
    /// Minutes since march start, tolerance in minutes.
    TimestampMinutes,
}

impl MergeKey {
    pub fn default_tolerance(self) -> f64 {
        match self {
            MergeKey::Timestamp => 30.0,
            MergeKey::TimestampMinutes => 1.0,
        }
    }
}

impl FromStr for MergeKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "timestamp" => Ok(MergeKey::Timestamp),
            "timestamp_minutes" => Ok(MergeKey::TimestampMinutes),
            _ => Err(format!(
                "Invalid merge key: {s}. Use timestamp or timestamp_minutes"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergeConfig {
    pub key: MergeKey,
    /// In seconds for `Timestamp`, in minutes for `TimestampMinutes`.
    pub tolerance: f64,
}

impl MergeConfig {
    pub fn new(key: MergeKey, tolerance: Option<f64>) -> Self {
        Self {
            key,
            tolerance: tolerance.unwrap_or_else(|| key.default_tolerance()),
        }
    }
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self::new(MergeKey::Timestamp, None)
    }
}

/// Parses "lat,lon".
fn parse_coordinate(s: &str) -> Result<Coordinate, String> {
    let (lat, lon) = s
        .split_once(',')
        .ok_or_else(|| format!("Invalid coordinate: {s}. Expected LAT,LON"))?;
    let lat: f64 = lat.trim().parse().map_err(|e| format!("{e}"))?;
    let lon: f64 = lon.trim().parse().map_err(|e| format!("{e}"))?;
    Ok(Coordinate::new(lat, lon))
}

/// Cadence timelines and watch alignment for march participants
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Compute step timelines from accelerometer recordings
    Steps {
        /// Root directory laid out as <participant>/<date>/acc.parquet
        #[arg(long)]
        data_dir: PathBuf,

        /// March event ID
        #[arg(long)]
        march_id: i64,

        /// Window size in seconds for step computation
        #[arg(long, default_value = "8")]
        window_size: u32,

        /// March start time (YYYY-MM-DDTHH:MM:SS), used for trimming when no GPS crossing is known
        #[arg(long)]
        march_start_time: Option<String>,

        /// JSON file with GPS crossing times per participant
        #[arg(long)]
        gps_trim_file: Option<PathBuf>,

        /// Hours added to accelerometer timestamps to match the watch clock
        #[arg(long, default_value = "1")]
        clock_offset_hours: i64,

        /// Output directory for CSV files
        #[arg(long, default_value = "./data/output")]
        output: PathBuf,
    },

    /// Build the watch timeline and health metrics from CSV/GPX/TCX exports
    Watch {
        /// Directory with <participant>[_<n>].csv exports and matching GPX/TCX files
        #[arg(long)]
        data_dir: PathBuf,

        /// March event ID
        #[arg(long)]
        march_id: i64,

        /// March start time (YYYY-MM-DDTHH:MM:SS), origin of timestamp_minutes
        #[arg(long)]
        march_start_time: Option<String>,

        /// Start banner position as LAT,LON
        #[arg(long, value_parser = parse_coordinate)]
        start_coords: Option<Coordinate>,

        /// Finish banner position as LAT,LON
        #[arg(long, value_parser = parse_coordinate)]
        end_coords: Option<Coordinate>,

        /// GPS tolerance in meters for detecting coordinate crossings
        #[arg(long, default_value = "50.0")]
        gps_tolerance: f64,

        /// Output directory for CSV files
        #[arg(long, default_value = "./data/output")]
        output: PathBuf,
    },

    /// Locate start/finish banner crossings in GPX tracks
    Crossings {
        /// Directory with <participant>[_<n>].gpx exports
        #[arg(long)]
        data_dir: PathBuf,

        /// Start banner position as LAT,LON
        #[arg(long, value_parser = parse_coordinate)]
        start_coords: Option<Coordinate>,

        /// Finish banner position as LAT,LON
        #[arg(long, value_parser = parse_coordinate)]
        end_coords: Option<Coordinate>,

        /// GPS tolerance in meters for detecting coordinate crossings
        #[arg(long, default_value = "50.0")]
        gps_tolerance: f64,

        /// Output directory for gps_crossing_times.json
        #[arg(long, default_value = "./data/output")]
        output: PathBuf,
    },

    /// Merge watch and accelerometer step timelines
    Merge {
        /// march_timeseries_data.csv from watch processing
        #[arg(long)]
        watch_data: PathBuf,

        /// march_step_data.csv from step processing
        #[arg(long)]
        step_data: PathBuf,

        /// march_health_metrics.csv to merge the step summary into
        #[arg(long)]
        watch_summary: Option<PathBuf>,

        /// march_step_summary.csv from step processing
        #[arg(long)]
        step_summary: Option<PathBuf>,

        /// Column to merge on (timestamp or timestamp_minutes)
        #[arg(long, default_value = "timestamp")]
        merge_on: MergeKey,

        /// Merge tolerance in seconds (timestamp) or minutes (timestamp_minutes)
        #[arg(long)]
        tolerance: Option<f64>,

        /// Output directory for merged CSV files
        #[arg(long, default_value = "./data/output")]
        output: PathBuf,
    },
}
