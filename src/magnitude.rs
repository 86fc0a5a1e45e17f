use log::warn;

use crate::filters;
use crate::{MagnitudeSeries, Sample};

/// Cutoff used to strip gravity and slow drift from the magnitude.
pub const GRAVITY_CUTOFF_HZ: f32 = 0.5;

/// Reduces triaxial samples to a gravity-free magnitude series.
///
/// A file that cannot be filtered (usually too few samples) yields an empty
/// series so the caller can skip it without aborting the batch.
pub fn extract(samples: &[Sample], fs: f32, order: usize) -> MagnitudeSeries {
    let raw: Vec<f32> = samples.iter().map(Sample::magnitude).collect();

    let values = match filters::highpass(&raw, GRAVITY_CUTOFF_HZ, fs, order) {
        Ok(values) => values,
        Err(e) => {
            warn!("High-pass filtering failed - Reason: {e}");
            return MagnitudeSeries::default();
        }
    };

    MagnitudeSeries {
        timestamps: samples.iter().map(|s| s.timestamp).collect(),
        values,
    }
}
