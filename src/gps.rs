use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::{error, info, warn};
use walkdir::WalkDir;

use crate::config::CrossingConfig;
use crate::data_loading;
use crate::error::Result;
use crate::{Coordinate, CrossingTime, GpsPoint, Timestamp};

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in meters.
pub fn haversine_distance(a: Coordinate, b: Coordinate) -> f64 {
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();
    let h = (dlat / 2.0).sin().powi(2)
        + a.latitude.to_radians().cos()
            * b.latitude.to_radians().cos()
            * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_M * c
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Crossing {
    pub timestamp: Timestamp,
    pub distance_m: f64,
}

/// First point of `track` within `tolerance_m` of `target`, in track order.
pub fn find_crossing(track: &[GpsPoint], target: Coordinate, tolerance_m: f64) -> Option<Crossing> {
    let mut closest = f64::INFINITY;
    for point in track {
        let distance_m = haversine_distance(point.position, target);
        if distance_m <= tolerance_m {
            info!(
                "Found GPS crossing at {} (distance: {distance_m:.1}m from target)",
                point.timestamp
            );
            return Some(Crossing {
                timestamp: point.timestamp,
                distance_m,
            });
        }
        closest = closest.min(distance_m);
    }

    if !track.is_empty() {
        warn!(
            "No GPS crossing found within {tolerance_m}m tolerance. \
             Closest approach: {closest:.1}m"
        );
    }
    None
}

/// Start and finish crossings of a time-sorted track. The finish is only
/// searched for after the start when a start was found.
pub fn find_crossing_times(
    participant_id: &str,
    track: &[GpsPoint],
    config: &CrossingConfig,
) -> Option<CrossingTime> {
    let start = config
        .start
        .and_then(|target| find_crossing(track, target, config.tolerance_m))
        .map(|c| c.timestamp);
    if let Some(start) = start {
        info!("{participant_id}: Start crossing at {start}");
    }

    let end = config.end.and_then(|target| {
        let after_start = match start {
            Some(start) => {
                let from = track.partition_point(|p| p.timestamp <= start);
                &track[from..]
            }
            None => track,
        };
        find_crossing(after_start, target, config.tolerance_m).map(|c| c.timestamp)
    });
    if let Some(end) = end {
        info!("{participant_id}: End crossing at {end}");
    }

    let crossing = CrossingTime { start, end };
    if crossing.is_empty() {
        warn!("{participant_id}: No GPS crossings found");
        return None;
    }
    Some(crossing)
}

/// Keeps the rows inside the crossing window, bounds inclusive.
pub fn trim_by_crossing<T>(
    rows: Vec<T>,
    crossing: &CrossingTime,
    timestamp: impl Fn(&T) -> Timestamp,
) -> Vec<T> {
    rows.into_iter()
        .filter(|row| crossing.contains(timestamp(row)))
        .collect()
}

/// Splits `SM001_2` into `("SM001", Some(2))` and `SM001` into
/// `("SM001", None)`. `None` for stems that are not `<alnum>` or
/// `<alnum>_<digits>`.
pub fn split_activity_stem(stem: &str) -> Option<(&str, Option<u32>)> {
    let alnum = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric());
    if alnum(stem) {
        return Some((stem, None));
    }
    let (id, n) = stem.rsplit_once('_')?;
    if !alnum(id) || n.is_empty() || !n.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some((id, Some(n.parse().ok()?)))
}

/// `SM001_2` belongs to `SM001`. Other stems are their own participant.
pub fn participant_from_stem(stem: &str) -> &str {
    split_activity_stem(stem).map_or(stem, |(id, _)| id)
}

fn gpx_files(dir: &Path) -> BTreeMap<String, Vec<PathBuf>> {
    let mut files: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    for entry in WalkDir::new(dir)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        let is_gpx = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("gpx"));
        if !entry.file_type().is_file() || !is_gpx {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        files
            .entry(participant_from_stem(stem).to_string())
            .or_default()
            .push(path.to_path_buf());
    }
    files
}

/// Finds crossing times for every participant with GPX tracks in `dir`.
/// A participant's activities are merged into one track before searching.
pub fn locate_crossings(
    dir: &Path,
    config: &CrossingConfig,
) -> Result<BTreeMap<String, CrossingTime>> {
    let mut crossings = BTreeMap::new();
    if config.start.is_none() && config.end.is_none() {
        warn!("No start or end coordinates given, skipping GPS crossing detection");
        return Ok(crossings);
    }
    if !dir.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("data directory not found: {}", dir.display()),
        )
        .into());
    }

    let participants = gpx_files(dir);
    info!("Found {} participants with GPX tracks", participants.len());

    for (participant_id, paths) in participants {
        let mut track = Vec::new();
        for path in &paths {
            match data_loading::read_gpx_track(path) {
                Ok(points) => track.extend(points),
                Err(e) => error!("Error parsing GPX file {}: {e}", path.display()),
            }
        }
        if track.is_empty() {
            warn!("{participant_id}: No track points found");
            continue;
        }
        track.sort_by_key(|p| p.timestamp);

        if let Some(crossing) = find_crossing_times(&participant_id, &track, config) {
            crossings.insert(participant_id, crossing);
        }
    }

    Ok(crossings)
}
