pub mod activity;
pub mod cadence;
pub mod config;
pub mod cycles;
pub mod data_loading;
pub mod error;
pub mod filters;
pub mod gps;
pub mod magnitude;
pub mod merge;
pub mod output;
pub mod steps;
pub mod timeline;
pub mod watch;

pub use error::{CadenceError, Result};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Wall-clock time as recorded by the devices. No offset is stored in any of
/// the input formats, so everything downstream stays naive.
pub type Timestamp = NaiveDateTime;

/// One triaxial accelerometer reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub timestamp: Timestamp,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Sample {
    pub fn magnitude(&self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

/// One reading of the three PPG channels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PpgSample {
    pub timestamp: Timestamp,
    pub p0: f32,
    pub p1: f32,
    pub p2: f32,
}

/// Gravity-free acceleration magnitude, one value per sample.
#[derive(Debug, Clone, Default)]
pub struct MagnitudeSeries {
    pub timestamps: Vec<Timestamp>,
    pub values: Vec<f32>,
}

impl MagnitudeSeries {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowStatus {
    /// Cadence passed the spectral quality gate.
    Accepted,
    /// Fewer than three seconds of samples in the window.
    InsufficientData,
    /// Spectrum did not look like gait (standing, arm movement, noise).
    Rejected,
}

/// Cadence estimate for one fixed-duration window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowEstimate {
    pub window_start: Timestamp,
    /// Steps per second, 0 unless `status` is `Accepted`.
    pub sps: f32,
    /// Position of the representative sample inside the window.
    pub sample: usize,
    pub status: WindowStatus,
}

impl WindowEstimate {
    pub fn empty(window_start: Timestamp, status: WindowStatus) -> Self {
        Self {
            window_start,
            sps: 0.0,
            sample: 0,
            status,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpsPoint {
    pub timestamp: Timestamp,
    pub position: Coordinate,
}

/// Times at which a participant's GPS track passed the start and finish
/// banners. A missing side means no crossing was found for it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CrossingTime {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "data_loading::optional_timestamp"
    )]
    pub start: Option<Timestamp>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "data_loading::optional_timestamp"
    )]
    pub end: Option<Timestamp>,
}

impl CrossingTime {
    pub fn is_empty(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    pub fn contains(&self, timestamp: Timestamp) -> bool {
        self.start.map_or(true, |start| timestamp >= start)
            && self.end.map_or(true, |end| timestamp <= end)
    }
}
