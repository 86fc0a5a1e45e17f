use std::f32::consts::PI;

use chrono::{Duration, NaiveTime};
use log::trace;
use rustfft::{num_complex::Complex, FftPlanner};

use crate::config::CadenceConfig;
use crate::cycles::{self, argmax, local_maxima, median};
use crate::error::Result;
use crate::filters;
use crate::{MagnitudeSeries, Timestamp, WindowEstimate, WindowStatus};

/// Frequency band searched for the gait fundamental, in Hz.
const MIN_GAIT_HZ: f32 = 1.4;
const MAX_GAIT_HZ: f32 = 10.0;
/// Minimum scaled spectral amplitude for a window to count as walking.
const MIN_AMPLITUDE: f32 = 100.0;
/// Maximum median-to-peak ratio (x10) over the noise bins.
const MAX_PEAK_TO_NOISE: f32 = 2.0;
/// Bins `NOISE_BINS` of the spectrum are used to estimate the noise floor.
const NOISE_BINS: std::ops::RangeInclusive<usize> = 7..=50;
/// Converts the peak magnitude to an amplitude in the signal's units. The
/// 1.63 undoes the energy loss of the Hamming window.
const AMPLITUDE_SCALE: f32 = 1.63 * 2.0;
/// Low-pass applied before counting cycles in the time domain.
const CYCLE_LOWPASS_HZ: f32 = 10.0;

/// Dominant component of a window's spectrum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpectralPeak {
    pub frequency: f32,
    pub amplitude: f32,
    pub peak_to_noise: f32,
}

impl SpectralPeak {
    fn is_gait(&self) -> bool {
        (MIN_GAIT_HZ..MAX_GAIT_HZ).contains(&self.frequency)
            && self.amplitude > MIN_AMPLITUDE
            && self.peak_to_noise < MAX_PEAK_TO_NOISE
    }
}

/// Samples of one window, borrowed from the series.
#[derive(Debug, Clone, Copy)]
pub struct Window<'a> {
    pub start: Timestamp,
    pub values: &'a [f32],
}

/// Symmetric Hamming window.
fn hamming(n: usize) -> Vec<f32> {
    if n == 1 {
        return vec![1.0];
    }
    let denom = (n - 1) as f32;
    (0..n)
        .map(|i| 0.54 - 0.46 * (2.0 * PI * i as f32 / denom).cos())
        .collect()
}

/// Magnitudes of the positive-frequency half of the Hamming-windowed
/// spectrum, zeroed outside the gait band.
fn gait_spectrum(values: &[f32], fs: f32) -> Vec<f32> {
    let n = values.len();
    let window = hamming(n);

    let mut buffer: Vec<Complex<f32>> = values
        .iter()
        .zip(&window)
        .map(|(&x, &w)| Complex::new(x * w, 0.0))
        .collect();

    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(n);
    fft.process(&mut buffer);

    buffer[..n / 2]
        .iter()
        .enumerate()
        .map(|(k, c)| {
            let freq = k as f32 * fs / n as f32;
            if (MIN_GAIT_HZ..=MAX_GAIT_HZ).contains(&freq) {
                c.norm()
            } else {
                0.0
            }
        })
        .collect()
}

/// Locates the dominant spectral peak. Returns `None` when the band holds
/// no energy at all.
pub fn spectral_peak(values: &[f32], fs: f32) -> Option<SpectralPeak> {
    let n = values.len();
    if n == 0 {
        return None;
    }
    let spectrum = gait_spectrum(values, fs);
    let max = spectrum.iter().copied().fold(0.0_f32, f32::max);
    if !(max > 0.0) {
        return None;
    }

    // The first proper local maximum reaching the global maximum; a plateau
    // reports its middle bin.
    let bin = local_maxima(&spectrum)
        .into_iter()
        .find(|&k| spectrum[k] >= max)
        .or_else(|| argmax(&spectrum))?;

    let noise_end = (*NOISE_BINS.end() + 1).min(spectrum.len());
    let noise_start = (*NOISE_BINS.start()).min(noise_end);
    let ratios: Vec<f32> = spectrum[noise_start..noise_end]
        .iter()
        .map(|m| m / max * 10.0)
        .collect();

    Some(SpectralPeak {
        frequency: bin as f32 * fs / n as f32,
        amplitude: max / n as f32 * AMPLITUDE_SCALE,
        peak_to_noise: median(&ratios).unwrap_or(f32::INFINITY),
    })
}

/// Halves the spectral frequency when it sits on the second harmonic of the
/// time-domain cadence, or is implausibly fast.
pub fn correct_harmonic(fft_freq: f32, sps_peaks: f32) -> f32 {
    let on_harmonic = (fft_freq / 2.0 - sps_peaks).abs() <= 0.5
        && sps_peaks >= 1.4
        && fft_freq >= 2.8;
    if on_harmonic || fft_freq >= 5.0 {
        fft_freq / 2.0
    } else {
        fft_freq
    }
}

/// Estimates the cadence of a single window of magnitude samples.
pub fn estimate_window(
    values: &[f32],
    window_start: Timestamp,
    config: &CadenceConfig,
) -> Result<WindowEstimate> {
    if values.len() < config.min_window_samples() {
        return Ok(WindowEstimate::empty(
            window_start,
            WindowStatus::InsufficientData,
        ));
    }

    let peak = match spectral_peak(values, config.sample_rate) {
        Some(peak) if peak.is_gait() => peak,
        other => {
            trace!("{window_start}: rejected spectrum {other:?}");
            return Ok(WindowEstimate::empty(window_start, WindowStatus::Rejected));
        }
    };

    let smoothed = filters::lowpass(
        values,
        CYCLE_LOWPASS_HZ,
        config.sample_rate,
        config.lowpass_order,
    )?;
    let count = cycles::count_cycles(&smoothed);
    let sps_peaks = (count.peak_count() + 1) as f32 / config.window_seconds as f32;
    let sps = correct_harmonic(peak.frequency, sps_peaks);

    trace!(
        "{window_start}: fft {:.3} Hz, amplitude {:.1}, noise {:.3}, peaks {:.3} sps -> {sps:.3}",
        peak.frequency,
        peak.amplitude,
        peak.peak_to_noise,
        sps_peaks
    );

    Ok(WindowEstimate {
        window_start,
        sps,
        sample: values.len() / 2,
        status: WindowStatus::Accepted,
    })
}

/// Splits a time-sorted series into wall-clock windows of `window_seconds`.
///
/// Window boundaries are aligned to midnight of the first sample's day. Every
/// window between the first and the last occupied one is returned, including
/// empty ones.
pub fn split_windows<'a>(
    timestamps: &[Timestamp],
    values: &'a [f32],
    window_seconds: u32,
) -> Vec<Window<'a>> {
    let Some(&first) = timestamps.first() else {
        return Vec::new();
    };
    let origin = first.date().and_time(NaiveTime::MIN);
    let width = Duration::seconds(i64::from(window_seconds.max(1)));
    let width_ns = width.num_nanoseconds().unwrap_or(i64::MAX);

    let bucket = |t: Timestamp| -> i64 {
        (t - origin)
            .num_nanoseconds()
            .unwrap_or(i64::MAX)
            .div_euclid(width_ns)
    };

    let mut windows = Vec::new();
    let mut begin = 0;
    let mut current = bucket(first);
    for (i, &t) in timestamps.iter().enumerate().skip(1) {
        let b = bucket(t);
        if b != current {
            windows.push(Window {
                start: origin + width * current as i32,
                values: &values[begin..i],
            });
            for gap in current + 1..b {
                windows.push(Window {
                    start: origin + width * gap as i32,
                    values: &[],
                });
            }
            begin = i;
            current = b;
        }
    }
    windows.push(Window {
        start: origin + width * current as i32,
        values: &values[begin..],
    });

    windows
}

/// Estimates cadence for every window of a magnitude series.
pub fn estimate_series(
    series: &MagnitudeSeries,
    config: &CadenceConfig,
) -> Result<Vec<WindowEstimate>> {
    let sorted;
    let (timestamps, values) = if series.timestamps.windows(2).all(|w| w[0] <= w[1]) {
        (&series.timestamps[..], &series.values[..])
    } else {
        let mut order: Vec<usize> = (0..series.len()).collect();
        order.sort_by_key(|&i| series.timestamps[i]);
        sorted = (
            order.iter().map(|&i| series.timestamps[i]).collect::<Vec<_>>(),
            order.iter().map(|&i| series.values[i]).collect::<Vec<_>>(),
        );
        (&sorted.0[..], &sorted.1[..])
    };

    split_windows(timestamps, values, config.window_seconds)
        .into_iter()
        .map(|w| estimate_window(w.values, w.start, config))
        .collect()
}
