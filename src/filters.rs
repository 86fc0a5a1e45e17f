//! Zero-phase Butterworth filters.
//!
//! Every filter is designed as second-order sections and run forward and
//! backward over the signal, so the output has no phase delay relative to
//! the input. Parameters are checked up front; a bad cutoff, order or
//! sampling rate is reported as [`CadenceError::InvalidFilterParameters`]
//! and never reaches the numerical routine.

use log::warn;
use sci_rs::signal::filter::design::{
    butter_dyn, DigitalFilter, FilterBandType, FilterOutputType, Sos, SosFormatFilter,
};
use sci_rs::signal::filter::sosfiltfilt_dyn;

use crate::error::{CadenceError, FilterFault, Result};
use crate::{PpgSample, Sample};

pub const DEFAULT_ORDER: usize = 5;

/// Cutoffs above this fraction of Nyquist are numerically unreliable.
const MAX_NYQUIST_FRACTION: f32 = 0.95;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Band {
    Lowpass,
    Highpass,
    Bandpass,
}

impl Band {
    fn name(self) -> &'static str {
        match self {
            Band::Lowpass => "lowpass",
            Band::Highpass => "highpass",
            Band::Bandpass => "bandpass",
        }
    }

    fn design_type(self) -> FilterBandType {
        match self {
            Band::Lowpass => FilterBandType::Lowpass,
            Band::Highpass => FilterBandType::Highpass,
            Band::Bandpass => FilterBandType::Bandpass,
        }
    }
}

/// Butterworth high-pass filter keeping content above `cutoff` Hz.
pub fn highpass(signal: &[f32], cutoff: f32, fs: f32, order: usize) -> Result<Vec<f32>> {
    validate_common(signal.len(), fs, order, Band::Highpass)?;
    validate_cutoff(cutoff, fs, "cutoff")?;
    run(signal, vec![cutoff], fs, order, Band::Highpass)
}

/// Butterworth low-pass filter keeping content below `cutoff` Hz.
pub fn lowpass(signal: &[f32], cutoff: f32, fs: f32, order: usize) -> Result<Vec<f32>> {
    validate_common(signal.len(), fs, order, Band::Lowpass)?;
    validate_cutoff(cutoff, fs, "cutoff")?;
    run(signal, vec![cutoff], fs, order, Band::Lowpass)
}

/// Butterworth band-pass filter keeping content between `low` and `high` Hz.
pub fn bandpass(signal: &[f32], low: f32, high: f32, fs: f32, order: usize) -> Result<Vec<f32>> {
    validate_common(signal.len(), fs, order, Band::Bandpass)?;
    validate_cutoff(low, fs, "low cutoff")?;
    validate_cutoff(high, fs, "high cutoff")?;
    if low >= high {
        return Err(CadenceError::InvalidFilterParameters(format!(
            "low cutoff ({low} Hz) must be below high cutoff ({high} Hz)"
        )));
    }
    run(signal, vec![low, high], fs, order, Band::Bandpass)
}

/// High-passes each accelerometer axis independently (default `lowcut` is
/// 10 Hz, order 5). Timestamps are carried over unchanged.
pub fn acceleration_filter(samples: &[Sample], fs: f32, lowcut: f32) -> Result<Vec<Sample>> {
    let xs: Vec<f32> = samples.iter().map(|s| s.x).collect();
    let ys: Vec<f32> = samples.iter().map(|s| s.y).collect();
    let zs: Vec<f32> = samples.iter().map(|s| s.z).collect();

    let xf = highpass(&xs, lowcut, fs, DEFAULT_ORDER)?;
    let yf = highpass(&ys, lowcut, fs, DEFAULT_ORDER)?;
    let zf = highpass(&zs, lowcut, fs, DEFAULT_ORDER)?;

    Ok(samples
        .iter()
        .enumerate()
        .map(|(i, s)| Sample {
            timestamp: s.timestamp,
            x: xf[i],
            y: yf[i],
            z: zf[i],
        })
        .collect())
}

/// Band-passes each PPG channel independently (defaults 0.3–4.0 Hz,
/// order 5).
pub fn ppg_filter(
    samples: &[PpgSample],
    fs: f32,
    lowcut: f32,
    highcut: f32,
) -> Result<Vec<PpgSample>> {
    let p0: Vec<f32> = samples.iter().map(|s| s.p0).collect();
    let p1: Vec<f32> = samples.iter().map(|s| s.p1).collect();
    let p2: Vec<f32> = samples.iter().map(|s| s.p2).collect();

    let p0f = bandpass(&p0, lowcut, highcut, fs, DEFAULT_ORDER)?;
    let p1f = bandpass(&p1, lowcut, highcut, fs, DEFAULT_ORDER)?;
    let p2f = bandpass(&p2, lowcut, highcut, fs, DEFAULT_ORDER)?;

    Ok(samples
        .iter()
        .enumerate()
        .map(|(i, s)| PpgSample {
            timestamp: s.timestamp,
            p0: p0f[i],
            p1: p1f[i],
            p2: p2f[i],
        })
        .collect())
}

fn validate_common(len: usize, fs: f32, order: usize, band: Band) -> Result<()> {
    if !(fs > 0.0) {
        return Err(CadenceError::InvalidFilterParameters(format!(
            "sampling frequency must be positive, got {fs}"
        )));
    }

    if order < 1 {
        return Err(CadenceError::InvalidFilterParameters(format!(
            "filter order must be >= 1, got {order}"
        )));
    }

    let min_required = 6 * order + 1;
    if len <= min_required {
        return Err(CadenceError::InvalidFilterParameters(format!(
            "signal too short for order-{order} {} filter: {len} samples, need at least {}",
            band.name(),
            min_required + 1
        )));
    }

    let recommended = 9 * order;
    if len < recommended {
        warn!(
            "signal length ({len}) is below the recommended {recommended} samples \
             for an order-{order} filter, output may contain edge artifacts"
        );
    }

    Ok(())
}

fn validate_cutoff(cutoff: f32, fs: f32, label: &str) -> Result<()> {
    let nyquist = 0.5 * fs;
    let limit = MAX_NYQUIST_FRACTION * nyquist;

    if !(cutoff > 0.0) {
        return Err(CadenceError::InvalidFilterParameters(format!(
            "{label} frequency must be positive, got {cutoff}"
        )));
    }

    if cutoff >= limit {
        return Err(CadenceError::InvalidFilterParameters(format!(
            "{label} frequency ({cutoff} Hz) must be below {limit:.2} Hz \
             (0.95 x Nyquist {nyquist} Hz)"
        )));
    }

    Ok(())
}

fn run(signal: &[f32], cutoffs: Vec<f32>, fs: f32, order: usize, band: Band) -> Result<Vec<f32>> {
    let sos = design(cutoffs, fs, order, band)?;

    // Matches the odd-extension length used by sosfiltfilt.
    let padlen = 3 * (2 * sos.len() + 1);
    if signal.len() <= padlen {
        return Err(CadenceError::FilterExecution {
            kind: band.name(),
            source: FilterFault::PaddingExceedsSignal {
                len: signal.len(),
                padlen,
            },
        });
    }

    let filtered: Vec<f32> = sosfiltfilt_dyn(signal.iter(), &sos);

    if let Some(index) = filtered.iter().position(|v| !v.is_finite()) {
        return Err(CadenceError::FilterExecution {
            kind: band.name(),
            source: FilterFault::NonFiniteOutput { index },
        });
    }

    Ok(filtered)
}

fn design(cutoffs: Vec<f32>, fs: f32, order: usize, band: Band) -> Result<Vec<Sos<f32>>> {
    let filter = butter_dyn(
        order,
        cutoffs,
        Some(band.design_type()),
        Some(false),
        Some(FilterOutputType::Sos),
        Some(fs),
    );

    match filter {
        DigitalFilter::Sos(SosFormatFilter { sos }) => Ok(sos),
        _ => Err(CadenceError::FilterExecution {
            kind: band.name(),
            source: FilterFault::NotSecondOrderSections,
        }),
    }
}
