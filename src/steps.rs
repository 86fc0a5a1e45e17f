//! Batch step computation over a march's accelerometer directory.
//!
//! Recordings are laid out as `<participant>/<date>/acc.parquet` (or
//! `acc.csv`). Every file is shifted onto the watch clock, trimmed, run
//! through the cadence pipeline and stitched into one timeline per
//! participant. A file that fails is logged and skipped; it never aborts
//! the run.

use std::path::{Path, PathBuf};

use log::{error, info, warn};
use rayon::prelude::*;
use walkdir::WalkDir;

use crate::cadence;
use crate::config::StepRunConfig;
use crate::data_loading;
use crate::error::Result;
use crate::gps;
use crate::magnitude;
use crate::timeline::StepTimeline;
use crate::{CrossingTime, Sample, Timestamp};

/// Accepted recording names in order of preference. Only one recording per
/// date folder is read.
const RECORDING_NAMES: [&str; 2] = ["acc.parquet", "acc.csv"];

/// Which window of a participant's samples is kept.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrimBounds {
    /// GPS start/finish crossings, both inclusive.
    Crossing(CrossingTime),
    /// Everything from the march start on.
    MarchStart(Timestamp),
    Unbounded,
}

impl TrimBounds {
    /// Crossing times take priority over the global march start.
    pub fn for_participant(config: &StepRunConfig, participant_id: &str) -> Self {
        if let Some(crossing) = config.crossings.get(participant_id) {
            TrimBounds::Crossing(*crossing)
        } else if let Some(start) = config.march_start {
            TrimBounds::MarchStart(start)
        } else {
            TrimBounds::Unbounded
        }
    }

    pub fn apply(&self, samples: Vec<Sample>) -> Vec<Sample> {
        match self {
            TrimBounds::Crossing(crossing) => {
                gps::trim_by_crossing(samples, crossing, |s| s.timestamp)
            }
            TrimBounds::MarchStart(start) => samples
                .into_iter()
                .filter(|s| s.timestamp >= *start)
                .collect(),
            TrimBounds::Unbounded => samples,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantFiles {
    pub participant_id: String,
    /// Recordings sorted by path, which orders them by date.
    pub files: Vec<PathBuf>,
}

/// Outcome of a batch run.
#[derive(Debug, Clone, Default)]
pub struct StepRun {
    pub timelines: Vec<StepTimeline>,
    /// Participants with recordings but no usable timeline.
    pub excluded: Vec<String>,
}

/// Picks the recording of one date folder, parquet first.
fn pick_recording(date_dir: &Path) -> Option<PathBuf> {
    let present: Vec<PathBuf> = RECORDING_NAMES
        .iter()
        .map(|name| date_dir.join(name))
        .filter(|path| path.is_file())
        .collect();
    if present.len() > 1 {
        warn!(
            "{} holds several recordings, using {}",
            date_dir.display(),
            present[0].display()
        );
    }
    present.into_iter().next()
}

/// Finds `<participant>/<date>/acc.*` recordings under `data_dir`.
pub fn discover(data_dir: &Path) -> Vec<ParticipantFiles> {
    let mut participants: Vec<ParticipantFiles> = Vec::new();

    for entry in WalkDir::new(data_dir)
        .min_depth(2)
        .max_depth(2)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_dir() {
            continue;
        }
        let date_dir = entry.path();
        let Some(path) = pick_recording(date_dir) else {
            continue;
        };
        let Some(participant_id) = date_dir
            .parent()
            .and_then(Path::file_name)
            .and_then(|n| n.to_str())
        else {
            continue;
        };

        let date = entry.file_name().to_string_lossy();
        info!("Found accelerometer data: {participant_id}/{date}");

        match participants.last_mut() {
            Some(last) if last.participant_id == participant_id => last.files.push(path),
            _ => participants.push(ParticipantFiles {
                participant_id: participant_id.to_string(),
                files: vec![path],
            }),
        }
    }

    if participants.is_empty() {
        warn!("No accelerometer files found in {}", data_dir.display());
    } else {
        let total: usize = participants.iter().map(|p| p.files.len()).sum();
        info!(
            "Found {} participants with {total} total accelerometer files",
            participants.len()
        );
    }
    participants
}

/// Computes the step timeline of one recording. `Ok(None)` means the file
/// holds nothing usable after trimming and filtering.
pub fn process_file(
    participant_id: &str,
    path: &Path,
    config: &StepRunConfig,
) -> Result<Option<StepTimeline>> {
    let mut samples = data_loading::read_acceleration(path)?;
    for sample in &mut samples {
        sample.timestamp += config.clock_offset;
    }

    let original_len = samples.len();
    let bounds = TrimBounds::for_participant(config, participant_id);
    let samples = bounds.apply(samples);
    if samples.len() < original_len {
        info!(
            "{participant_id}: Trimming removed {} rows ({original_len} -> {})",
            original_len - samples.len(),
            samples.len()
        );
    }
    if samples.is_empty() {
        warn!("No data after trimming for {participant_id} ({bounds:?})");
        return Ok(None);
    }

    let settings = &config.cadence;
    let series = magnitude::extract(&samples, settings.sample_rate, settings.highpass_order);
    if series.is_empty() {
        warn!(
            "No valid data found for step calculation in {}",
            path.display()
        );
        return Ok(None);
    }

    let estimates = cadence::estimate_series(&series, settings)?;
    if estimates.is_empty() {
        warn!("No steps calculated for {participant_id}");
        return Ok(None);
    }

    Ok(Some(StepTimeline::from_estimates(
        participant_id,
        settings.window_seconds,
        estimates,
    )))
}

/// Processes and stitches all recordings of one participant.
pub fn process_participant(
    participant: &ParticipantFiles,
    config: &StepRunConfig,
) -> Option<StepTimeline> {
    let id = &participant.participant_id;
    let mut parts = Vec::new();

    for path in &participant.files {
        info!("Processing {id} - {}", path.display());
        match process_file(id, path, config) {
            Ok(Some(timeline)) => parts.push(timeline),
            Ok(None) => {}
            Err(e) => error!("Error processing {id} ({}): {e}", path.display()),
        }
    }

    if parts.len() > 1 {
        info!("Combining {} date files for {id}", parts.len());
    }
    let timeline = StepTimeline::stitch(parts)?;
    info!(
        "Successfully processed {id}: {} total steps",
        timeline.total_steps()
    );
    Some(timeline)
}

/// Runs every participant found under the configured data directory.
pub fn run(config: &StepRunConfig) -> Result<StepRun> {
    if !config.data_dir.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("data directory not found: {}", config.data_dir.display()),
        )
        .into());
    }

    let participants = discover(&config.data_dir);
    let results: Vec<(String, Option<StepTimeline>)> = participants
        .par_iter()
        .map(|p| (p.participant_id.clone(), process_participant(p, config)))
        .collect();

    let mut run = StepRun::default();
    for (participant_id, timeline) in results {
        match timeline {
            Some(timeline) => run.timelines.push(timeline),
            None => run.excluded.push(participant_id),
        }
    }

    info!(
        "Successfully processed {}/{} participants",
        run.timelines.len(),
        participants.len()
    );
    Ok(run)
}
