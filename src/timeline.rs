use crate::{Timestamp, WindowEstimate, WindowStatus};

/// One window of a participant's step timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimelineRow {
    pub timestamp: Timestamp,
    pub sps: f32,
    /// Steps accumulated up to and including this window.
    pub cumulative_steps: f64,
    pub sample: usize,
    pub status: WindowStatus,
}

/// Ordered cadence estimates for one participant.
#[derive(Debug, Clone, PartialEq)]
pub struct StepTimeline {
    pub participant_id: String,
    pub window_seconds: u32,
    pub rows: Vec<TimelineRow>,
}

/// Per-participant totals written alongside the timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct StepSummary {
    pub participant_id: String,
    pub total_steps: u64,
    pub avg_steps_per_second: f64,
    pub window_seconds: u32,
}

impl StepTimeline {
    /// Orders the estimates by window start and integrates the cadence.
    /// Windows sharing a start keep their input order.
    pub fn from_estimates(
        participant_id: impl Into<String>,
        window_seconds: u32,
        mut estimates: Vec<WindowEstimate>,
    ) -> Self {
        estimates.sort_by_key(|e| e.window_start);

        let width = f64::from(window_seconds);
        let mut cumulative = 0.0;
        let rows = estimates
            .into_iter()
            .map(|e| {
                cumulative += f64::from(e.sps) * width;
                TimelineRow {
                    timestamp: e.window_start,
                    sps: e.sps,
                    cumulative_steps: cumulative,
                    sample: e.sample,
                    status: e.status,
                }
            })
            .collect();

        Self {
            participant_id: participant_id.into(),
            window_seconds,
            rows,
        }
    }

    /// Joins timelines from several files of the same participant. The
    /// cumulative count is recomputed over the merged order rather than
    /// carried over from the parts.
    pub fn stitch(parts: Vec<StepTimeline>) -> Option<StepTimeline> {
        let first = parts.first()?;
        let participant_id = first.participant_id.clone();
        let window_seconds = first.window_seconds;

        let estimates = parts
            .into_iter()
            .flat_map(|part| part.rows)
            .map(|row| WindowEstimate {
                window_start: row.timestamp,
                sps: row.sps,
                sample: row.sample,
                status: row.status,
            })
            .collect();

        Some(Self::from_estimates(
            participant_id,
            window_seconds,
            estimates,
        ))
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn total_steps(&self) -> u64 {
        self.rows
            .last()
            .map_or(0, |row| row.cumulative_steps.max(0.0) as u64)
    }

    /// Mean cadence over windows with movement, rounded to two decimals.
    pub fn avg_steps_per_second(&self) -> f64 {
        let moving: Vec<f64> = self
            .rows
            .iter()
            .filter(|row| row.sps > 0.0)
            .map(|row| f64::from(row.sps))
            .collect();
        if moving.is_empty() {
            return 0.0;
        }
        let mean = moving.iter().sum::<f64>() / moving.len() as f64;
        (mean * 100.0).round() / 100.0
    }

    pub fn summary(&self) -> StepSummary {
        StepSummary {
            participant_id: self.participant_id.clone(),
            total_steps: self.total_steps(),
            avg_steps_per_second: self.avg_steps_per_second(),
            window_seconds: self.window_seconds,
        }
    }

    /// Minutes from `reference`, or from the first window when no reference
    /// is known.
    pub fn timestamp_minutes(&self, reference: Option<Timestamp>) -> Vec<f64> {
        let Some(origin) = reference.or_else(|| self.rows.first().map(|r| r.timestamp)) else {
            return Vec::new();
        };
        self.rows
            .iter()
            .map(|row| {
                let elapsed = row.timestamp - origin;
                elapsed.num_milliseconds() as f64 / 60_000.0
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};

    fn t(seconds: i64) -> Timestamp {
        NaiveDate::from_ymd_opt(2025, 3, 15)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap()
            + Duration::seconds(seconds)
    }

    fn est(seconds: i64, sps: f32) -> WindowEstimate {
        WindowEstimate {
            window_start: t(seconds),
            sps,
            sample: 208,
            status: if sps > 0.0 {
                WindowStatus::Accepted
            } else {
                WindowStatus::Rejected
            },
        }
    }

    fn cumulative(timeline: &StepTimeline) -> Vec<f64> {
        timeline.rows.iter().map(|r| r.cumulative_steps).collect()
    }

    #[test]
    fn cumulative_integrates_cadence() {
        let estimates = vec![est(0, 2.0), est(8, 0.0), est(16, 1.5)];
        let tl = StepTimeline::from_estimates("P1", 8, estimates);
        assert_eq!(cumulative(&tl), vec![16.0, 16.0, 28.0]);
        assert_eq!(tl.total_steps(), 28);
    }

    #[test]
    fn stitched_files_match_one_continuous_file() {
        // The later file is listed first on purpose.
        let morning = vec![est(0, 2.0), est(8, 1.8), est(16, 0.0)];
        let afternoon = vec![est(3600, 2.2), est(3608, 2.4)];

        let stitched = StepTimeline::stitch(vec![
            StepTimeline::from_estimates("P1", 8, afternoon.clone()),
            StepTimeline::from_estimates("P1", 8, morning.clone()),
        ])
        .unwrap();

        let whole = StepTimeline::from_estimates(
            "P1",
            8,
            morning.into_iter().chain(afternoon).collect(),
        );

        assert_eq!(stitched, whole);
        assert!(cumulative(&stitched).windows(2).all(|w| w[0] <= w[1]));
        // No reset at the file boundary.
        assert!(stitched.rows[3].cumulative_steps > stitched.rows[2].cumulative_steps);
    }

    #[test]
    fn stitch_of_nothing_is_none() {
        assert!(StepTimeline::stitch(Vec::new()).is_none());
    }

    #[test]
    fn summary_ignores_idle_windows() {
        let tl = StepTimeline::from_estimates(
            "P2",
            8,
            vec![est(0, 1.0), est(8, 0.0), est(16, 2.0), est(24, 2.0)],
        );
        let summary = tl.summary();
        assert_eq!(summary.total_steps, 40);
        assert_eq!(summary.avg_steps_per_second, 1.67);
    }

    #[test]
    fn idle_timeline_summary_is_zero() {
        let tl = StepTimeline::from_estimates("P3", 8, vec![est(0, 0.0)]);
        assert_eq!(tl.avg_steps_per_second(), 0.0);
        assert_eq!(tl.total_steps(), 0);
    }

    #[test]
    fn minutes_are_relative_to_reference_or_first_row() {
        let tl = StepTimeline::from_estimates("P1", 8, vec![est(120, 2.0), est(150, 2.0)]);
        assert_eq!(tl.timestamp_minutes(None), vec![0.0, 0.5]);
        assert_eq!(tl.timestamp_minutes(Some(t(0))), vec![2.0, 2.5]);
    }
}
