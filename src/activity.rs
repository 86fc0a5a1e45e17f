use crate::cadence;
use crate::config::CadenceConfig;
use crate::error::Result;
use crate::magnitude;
use crate::{Sample, WindowEstimate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityBand {
    Walking,
    FastWalking,
    Jogging,
    Running,
}

impl ActivityBand {
    /// Band for a window's cadence. Bounds are inclusive and leave small
    /// gaps between bands; cadences in a gap or under 1 sps are unclassified.
    pub fn classify(sps: f32) -> Option<Self> {
        if (1.0..=1.8).contains(&sps) {
            Some(ActivityBand::Walking)
        } else if (1.81..=2.4).contains(&sps) {
            Some(ActivityBand::FastWalking)
        } else if (2.41..=2.9).contains(&sps) {
            Some(ActivityBand::Jogging)
        } else if sps > 2.9 {
            Some(ActivityBand::Running)
        } else {
            None
        }
    }
}

/// Total steps and time spent in each activity band.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StepDistribution {
    pub steps: u64,
    pub walking_seconds: u64,
    pub walking_fast_seconds: u64,
    pub jogging_seconds: u64,
    pub running_seconds: u64,
    pub window_seconds: u32,
}

impl StepDistribution {
    pub fn from_estimates(estimates: &[WindowEstimate], window_seconds: u32) -> Self {
        let width = u64::from(window_seconds);
        let total_sps: f64 = estimates.iter().map(|e| f64::from(e.sps)).sum();

        let mut dist = StepDistribution {
            steps: (total_sps * width as f64).max(0.0) as u64,
            window_seconds,
            ..Default::default()
        };
        for e in estimates {
            match ActivityBand::classify(e.sps) {
                Some(ActivityBand::Walking) => dist.walking_seconds += width,
                Some(ActivityBand::FastWalking) => dist.walking_fast_seconds += width,
                Some(ActivityBand::Jogging) => dist.jogging_seconds += width,
                Some(ActivityBand::Running) => dist.running_seconds += width,
                None => {}
            }
        }
        dist
    }

    pub fn seconds(&self, band: ActivityBand) -> u64 {
        match band {
            ActivityBand::Walking => self.walking_seconds,
            ActivityBand::FastWalking => self.walking_fast_seconds,
            ActivityBand::Jogging => self.jogging_seconds,
            ActivityBand::Running => self.running_seconds,
        }
    }

    pub fn minutes(&self, band: ActivityBand) -> f64 {
        self.seconds(band) as f64 / 60.0
    }
}

/// Runs the whole cadence pipeline over raw samples and summarises it.
/// Returns `None` when the recording is too short to filter.
pub fn step_count_and_distribution(
    samples: &[Sample],
    config: &CadenceConfig,
) -> Result<Option<StepDistribution>> {
    let series = magnitude::extract(samples, config.sample_rate, config.highpass_order);
    if series.is_empty() {
        return Ok(None);
    }
    let estimates = cadence::estimate_series(&series, config)?;
    Ok(Some(StepDistribution::from_estimates(
        &estimates,
        config.window_seconds,
    )))
}
