//! Time-domain gait cycle counting.
//!
//! Each pass is a pure function over `(index, value)` extrema so the
//! intermediate results can be inspected and tested on their own. The passes
//! and their thresholds are tuned against the spectral estimator's harmonic
//! correction and have to stay in this exact order.

/// Samples per block when collecting minimum candidates.
const BLOCK: usize = 5;
/// Tail of the signal excluded from block scanning.
const BLOCK_TAIL: usize = 10;
/// Minimum depth below zero for a block minimum to count.
const MINIMUM_DEPTH: f32 = 100.0;
/// Minimum height for a peak candidate.
const PEAK_HEIGHT: f32 = 100.0;
/// Minimum ratio of a cycle's drop to the next cycle's drop.
const DROP_RATIO: f32 = 0.5;
/// A peak and its minimum this many samples apart are too slow for one step.
const MAX_PHASE_SAMPLES: usize = 40;
/// Fraction of the median peak height a cycle must reach.
const MEDIAN_FRACTION: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extremum {
    pub index: usize,
    pub value: f32,
}

impl Extremum {
    fn at(signal: &[f32], index: usize) -> Self {
        Self {
            index,
            value: signal[index],
        }
    }
}

/// A peak and the minimum paired with it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cycle {
    pub minimum: Extremum,
    pub peak: Extremum,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleCount {
    pub minima: Vec<usize>,
    pub peaks: Vec<usize>,
}

impl CycleCount {
    pub fn peak_count(&self) -> usize {
        self.peaks.len()
    }
}

/// Counts gait cycles in a low-passed magnitude window.
pub fn count_cycles(signal: &[f32]) -> CycleCount {
    let candidates = block_minima(signal);
    let minima = deep_minima(&candidates);
    let peaks = tall_peaks(peaks_between(signal, &minima));
    let cycles = consistent_cycles(signal, &peaks);
    let cycles = fast_cycles(cycles);
    let cycles = dominant_cycles(&cycles);

    CycleCount {
        minima: cycles.iter().map(|c| c.minimum.index).collect(),
        peaks: cycles.iter().map(|c| c.peak.index).collect(),
    }
}

/// Indices of the local maxima of `values`, following `scipy.signal`'s
/// `find_peaks`: edges never qualify, and a flat top reports its middle
/// sample.
pub(crate) fn local_maxima(values: &[f32]) -> Vec<usize> {
    let mut peaks = Vec::new();
    if values.len() < 3 {
        return peaks;
    }

    let last = values.len() - 1;
    let mut i = 1;
    while i < last {
        if values[i - 1] < values[i] {
            let mut ahead = i + 1;
            while ahead < last && values[ahead] == values[i] {
                ahead += 1;
            }
            if values[ahead] < values[i] {
                peaks.push((i + ahead - 1) / 2);
                i = ahead;
            }
        }
        i += 1;
    }

    peaks
}

/// First index of the smallest value.
pub(crate) fn argmin(values: &[f32]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, &v) in values.iter().enumerate() {
        if best.map_or(true, |b| v < values[b]) {
            best = Some(i);
        }
    }
    best
}

/// First index of the largest value.
pub(crate) fn argmax(values: &[f32]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, &v) in values.iter().enumerate() {
        if best.map_or(true, |b| v > values[b]) {
            best = Some(i);
        }
    }
    best
}

pub(crate) fn median(values: &[f32]) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Pass 1: the lowest sample of every 5-sample block.
fn block_minima(signal: &[f32]) -> Vec<Extremum> {
    let end = signal.len().saturating_sub(BLOCK_TAIL);
    (0..end)
        .step_by(BLOCK)
        .filter_map(|start| {
            let block = &signal[start..(start + BLOCK).min(signal.len())];
            argmin(block).map(|i| Extremum::at(signal, start + i))
        })
        .collect()
}

/// Pass 2: block minima that are themselves local minima and sit at least
/// `MINIMUM_DEPTH` below zero.
fn deep_minima(candidates: &[Extremum]) -> Vec<Extremum> {
    let negated: Vec<f32> = candidates.iter().map(|c| -c.value).collect();
    local_maxima(&negated)
        .into_iter()
        .filter(|&i| negated[i] >= MINIMUM_DEPTH)
        .map(|i| candidates[i])
        .collect()
}

/// Pass 3: the highest sample between each pair of consecutive minima.
fn peaks_between(signal: &[f32], minima: &[Extremum]) -> Vec<Extremum> {
    minima
        .windows(2)
        .filter_map(|pair| {
            let (from, to) = (pair[0].index, pair[1].index);
            argmax(&signal[from..to]).map(|i| Extremum::at(signal, from + i))
        })
        .collect()
}

/// Pass 4: drops peaks too low to be a foot strike.
fn tall_peaks(peaks: Vec<Extremum>) -> Vec<Extremum> {
    peaks.into_iter().filter(|p| p.value > PEAK_HEIGHT).collect()
}

/// Pass 5: re-derives the minimum after each peak and keeps cycles whose
/// drop is at least half the next cycle's drop. The last drop is compared
/// against the first.
fn consistent_cycles(signal: &[f32], peaks: &[Extremum]) -> Vec<Cycle> {
    let cycles: Vec<Cycle> = peaks
        .windows(2)
        .filter_map(|pair| {
            let (from, to) = (pair[0].index, pair[1].index);
            argmin(&signal[from..to]).map(|i| Cycle {
                minimum: Extremum::at(signal, from + i),
                peak: pair[0],
            })
        })
        .collect();

    let drops: Vec<f32> = cycles
        .iter()
        .map(|c| c.peak.value - c.minimum.value)
        .collect();

    cycles
        .iter()
        .enumerate()
        .filter(|&(i, _)| drops[i] / drops[(i + 1) % drops.len()] > DROP_RATIO)
        .map(|(_, c)| *c)
        .collect()
}

/// Pass 6: drops cycles whose peak-to-minimum phase is too long.
fn fast_cycles(cycles: Vec<Cycle>) -> Vec<Cycle> {
    cycles
        .into_iter()
        .filter(|c| c.minimum.index - c.peak.index < MAX_PHASE_SAMPLES)
        .collect()
}

/// Pass 7: pairs each minimum with the following cycle's peak and keeps the
/// pairs whose peak reaches half the median peak height.
fn dominant_cycles(cycles: &[Cycle]) -> Vec<Cycle> {
    let heights: Vec<f32> = cycles.iter().map(|c| c.peak.value).collect();
    let Some(median_height) = median(&heights) else {
        return Vec::new();
    };

    cycles
        .windows(2)
        .map(|pair| Cycle {
            minimum: pair[0].minimum,
            peak: pair[1].peak,
        })
        .filter(|c| c.peak.value > median_height * MEDIAN_FRACTION)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn tone(freq: f32, amplitude: f32, n: usize) -> Vec<f32> {
        (0..n)
            .map(|i| amplitude * (2.0 * PI * freq * i as f32 / 52.0).sin())
            .collect()
    }

    fn ex(index: usize, value: f32) -> Extremum {
        Extremum { index, value }
    }

    #[test]
    fn local_maxima_skips_edges_and_centres_plateaus() {
        assert_eq!(local_maxima(&[5.0, 1.0, 3.0, 1.0, 5.0]), vec![2]);
        assert_eq!(local_maxima(&[0.0, 2.0, 2.0, 2.0, 0.0]), vec![2]);
        assert_eq!(local_maxima(&[0.0, 2.0, 2.0, 0.0]), vec![1]);
        // A plateau that runs into the edge is not a peak.
        assert!(local_maxima(&[0.0, 2.0, 2.0]).is_empty());
        assert!(local_maxima(&[1.0, 2.0]).is_empty());
    }

    #[test]
    fn arg_extrema_take_first_occurrence() {
        assert_eq!(argmin(&[3.0, 1.0, 1.0]), Some(1));
        assert_eq!(argmax(&[3.0, 1.0, 3.0]), Some(0));
        assert_eq!(argmin(&[]), None);
    }

    #[test]
    fn block_minima_stop_before_tail() {
        let signal: Vec<f32> = (0..23).map(|i| -(i as f32)).collect();
        let minima = block_minima(&signal);
        // Blocks start at 0, 5 and 10; 15 is inside the excluded tail.
        assert_eq!(
            minima.iter().map(|m| m.index).collect::<Vec<_>>(),
            vec![4, 9, 14]
        );
    }

    #[test]
    fn shallow_minima_are_ignored() {
        let candidates = vec![
            ex(0, 0.0),
            ex(5, -150.0),
            ex(10, 0.0),
            ex(15, -50.0),
            ex(20, 0.0),
        ];
        assert_eq!(deep_minima(&candidates), vec![ex(5, -150.0)]);
    }

    #[test]
    fn inconsistent_drop_is_removed() {
        // Drops: 400, 100, 400. 400/100 passes, 100/400 fails, 400/400
        // (wrapping to the first) passes.
        let mut signal = vec![150.0; 40];
        signal[0] = 200.0;
        signal[5] = -200.0;
        signal[10] = 200.0;
        signal[15] = 100.0;
        signal[20] = 200.0;
        signal[25] = -200.0;
        signal[30] = 200.0;
        let peaks = vec![ex(0, 200.0), ex(10, 200.0), ex(20, 200.0), ex(30, 200.0)];
        let cycles = consistent_cycles(&signal, &peaks);
        let minima: Vec<usize> = cycles.iter().map(|c| c.minimum.index).collect();
        assert_eq!(minima, vec![5, 25]);
    }

    #[test]
    fn slow_phases_are_dropped() {
        let cycles = vec![
            Cycle {
                minimum: ex(30, -200.0),
                peak: ex(10, 200.0),
            },
            Cycle {
                minimum: ex(100, -200.0),
                peak: ex(50, 200.0),
            },
        ];
        assert_eq!(fast_cycles(cycles).len(), 1);
    }

    #[test]
    fn weak_peaks_below_half_median_are_dropped() {
        let cycles: Vec<Cycle> = [400.0, 400.0, 150.0, 400.0]
            .iter()
            .enumerate()
            .map(|(i, &h)| Cycle {
                minimum: ex(i * 20 + 10, -200.0),
                peak: ex(i * 20, h),
            })
            .collect();
        let kept = dominant_cycles(&cycles);
        // Pairs (min0, peak1), (min1, peak2), (min2, peak3); peak2 = 150 < 200.
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].peak.index, 20);
        assert_eq!(kept[1].peak.index, 60);
    }

    #[test]
    fn counts_cycles_of_a_clean_gait_signal() {
        // 2 Hz for 8 s is 16 cycles. The first and last are lost at the
        // window edges and one more to the final re-pairing.
        let count = count_cycles(&tone(2.0, 500.0, 416));
        assert!(
            (12..=15).contains(&count.peak_count()),
            "{} peaks",
            count.peak_count()
        );
        assert_eq!(count.minima.len(), count.peaks.len());
    }

    #[test]
    fn quiet_signal_has_no_cycles() {
        let count = count_cycles(&tone(2.0, 50.0, 416));
        assert_eq!(count, CycleCount::default());
    }

    #[test]
    fn tiny_inputs_do_not_panic() {
        assert_eq!(count_cycles(&[]), CycleCount::default());
        assert_eq!(count_cycles(&[1.0; 9]), CycleCount::default());
    }
}
