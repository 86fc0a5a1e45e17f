use std::f32::consts::PI;
use std::fmt::Write as _;
use std::path::Path;

use chrono::{Duration, NaiveDate, NaiveDateTime};

use march_cadence::config::{MergeConfig, StepRunConfig, WatchRunConfig};
use march_cadence::data_loading;
use march_cadence::merge::{self, StepRow, WatchTable};
use march_cadence::{output, steps, watch, CrossingTime};

const FS: i64 = 52;

fn day(d: u32, h: u32, m: u32, s: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 3, d)
        .unwrap()
        .and_hms_opt(h, m, s)
        .unwrap()
}

/// Writes `seconds` of a 2 Hz gait on top of 1 g to `acc.csv`.
fn write_recording(path: &Path, start: NaiveDateTime, seconds: i64) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let mut body = String::from("Time,X,Y,Z\n");
    for i in 0..seconds * FS {
        let t = start + Duration::nanoseconds(i * 1_000_000_000 / FS);
        let x = 1000.0 + 500.0 * (2.0 * PI * (i % 26) as f32 / 26.0).sin();
        writeln!(body, "{},{x},0,0", t.format("%Y-%m-%d %H:%M:%S%.f")).unwrap();
    }
    std::fs::write(path, body).unwrap();
}

#[test]
fn multi_day_recordings_produce_one_continuous_timeline() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    write_recording(&data.join("SM001/2025-03-15/acc.csv"), day(15, 8, 0, 0), 80);
    write_recording(&data.join("SM001/2025-03-16/acc.csv"), day(16, 8, 0, 0), 80);
    let broken = data.join("SM002/2025-03-15/acc.csv");
    std::fs::create_dir_all(broken.parent().unwrap()).unwrap();
    std::fs::write(&broken, "Time,X,Y\n2025-03-15 08:00:00,1,2\n").unwrap();

    let run = steps::run(&StepRunConfig::new(7, &data)).unwrap();
    assert_eq!(run.timelines.len(), 1);
    assert_eq!(run.excluded, vec!["SM002".to_string()]);

    let timeline = &run.timelines[0];
    assert_eq!(timeline.participant_id, "SM001");
    // Clock shifted by one hour.
    assert_eq!(timeline.rows[0].timestamp, day(15, 9, 0, 0));
    assert_eq!(timeline.rows.len(), 20);
    assert!(timeline
        .rows
        .windows(2)
        .all(|w| w[0].cumulative_steps <= w[1].cumulative_steps));
    // The second day continues the count instead of starting over.
    assert!(timeline.rows[10].cumulative_steps > timeline.rows[9].cumulative_steps);
    let total = timeline.total_steps();
    assert!((300..=320).contains(&total), "{total} steps");

    let out = dir.path().join("out");
    output::write_step_outputs(&out, 7, None, &run.timelines).unwrap();
    let rows: Vec<StepRow> = data_loading::read_records(&out.join(output::STEP_DATA_FILE)).unwrap();
    assert_eq!(rows.len(), 20);
    assert_eq!(rows[0].march_id, 7);
    assert_eq!(rows[19].cumulative_steps, timeline.rows[19].cumulative_steps);
}

#[test]
fn crossing_window_trims_before_processing() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    write_recording(&data.join("SM001/2025-03-15/acc.csv"), day(15, 8, 0, 0), 80);

    let mut config = StepRunConfig::new(7, &data);
    // On the shifted clock, keep 09:00:40 to 09:01:20.
    config.crossings.insert(
        "SM001".into(),
        CrossingTime {
            start: Some(day(15, 9, 0, 40)),
            end: None,
        },
    );
    config.march_start = Some(day(15, 8, 0, 0));

    let run = steps::run(&config).unwrap();
    let timeline = &run.timelines[0];
    assert_eq!(timeline.rows[0].timestamp, day(15, 9, 0, 40));
    assert_eq!(timeline.rows.len(), 5);
}

#[test]
fn merge_files_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let watch_path = dir.path().join("march_timeseries_data.csv");
    std::fs::write(
        &watch_path,
        "march_id,user_id,timestamp,timestamp_minutes,heart_rate,steps,cumulative_distance_km\n\
         7,SM001,2025-03-15 09:00:10,0.0,110,5,0.01\n\
         7,SM001,2025-03-15 09:00:50,1.0,120,40,0.05\n\
         7,SM001,2025-03-15 11:00:00,120.0,130,,6.4\n\
         7,SM009,2025-03-15 09:00:00,0.0,100,12,\n",
    )
    .unwrap();

    let step_path = dir.path().join("march_step_data.csv");
    std::fs::write(
        &step_path,
        "march_id,user_id,timestamp,steps_per_second,cumulative_steps,sample,window_size_seconds,timestamp_minutes\n\
         7,SM001,2025-03-15 09:00:08,2.0,16.0,208,8,0.0\n\
         7,SM001,2025-03-15 09:00:48,2.0,80.0,208,8,0.67\n",
    )
    .unwrap();

    let watch = WatchTable::read(&watch_path).unwrap();
    let step_rows: Vec<StepRow> = data_loading::read_records(&step_path).unwrap();
    let merged = merge::merge_timelines(watch, &step_rows, &MergeConfig::default());
    assert_eq!(merged.rows.len(), 4);

    let out = dir.path().join("out");
    let path = output::write_merged_timeline(&out, &merged).unwrap();
    let table = data_loading::read_table(&path).unwrap();
    assert_eq!(
        table.headers,
        vec![
            "march_id",
            "user_id",
            "timestamp",
            "timestamp_minutes",
            "heart_rate",
            "steps",
            "cumulative_distance_km",
            "steps_per_second"
        ]
    );

    let steps_col = table.column("steps").unwrap();
    let sps_col = table.column("steps_per_second").unwrap();
    assert_eq!(table.rows[0][steps_col], "16");
    assert_eq!(table.rows[0][sps_col], "2");
    assert_eq!(table.rows[1][steps_col], "80");
    // Stride 50 m / 80 steps = 0.625 m, so 6.4 km is 10240 steps.
    let estimated: f64 = table.rows[2][steps_col].parse().unwrap();
    assert!((estimated - 10240.0).abs() < 1e-6, "{estimated}");
    assert_eq!(table.rows[2][sps_col], "");
    // No step data at all for SM009: the watch row is untouched.
    assert_eq!(table.rows[3][1], "SM009");
    assert_eq!(table.rows[3][steps_col], "12");
    assert_eq!(table.rows[3][4], "100");
}

#[test]
fn watch_exports_feed_the_merge() {
    let dir = tempfile::tempdir().unwrap();
    let exports = dir.path().join("watch");
    std::fs::create_dir_all(&exports).unwrap();
    let mut body = String::from("timestamp,heart_rate,steps\n");
    for i in 0..18 {
        let t = day(15, 9, 0, 0) + Duration::seconds(i * 10);
        writeln!(body, "{},{},{}", t.format("%Y-%m-%d %H:%M:%S"), 100 + i, i * 10).unwrap();
    }
    std::fs::write(exports.join("SM001.csv"), body).unwrap();

    let mut config = WatchRunConfig::new(7, &exports);
    config.march_start = Some(day(15, 9, 0, 0));
    let run = watch::run(&config).unwrap();
    let out = dir.path().join("out");
    output::write_watch_outputs(&out, 7, &run).unwrap();

    let watch_table = WatchTable::read(&out.join(output::WATCH_DATA_FILE)).unwrap();
    assert_eq!(watch_table.rows.len(), 3);
    assert_eq!(watch_table.rows[0].steps, Some(50.0));

    let step_rows: Vec<StepRow> = [(day(15, 9, 0, 8), 16.0), (day(15, 9, 1, 4), 128.0)]
        .into_iter()
        .map(|(timestamp, cumulative_steps)| StepRow {
            march_id: 7,
            user_id: "SM001".into(),
            timestamp,
            steps_per_second: 2.0,
            cumulative_steps,
            sample: 208,
            window_size_seconds: 8,
            timestamp_minutes: 0.0,
        })
        .collect();
    let merged = merge::merge_timelines(watch_table, &step_rows, &MergeConfig::default());
    let steps: Vec<Option<f64>> = merged.rows.iter().map(|r| r.steps).collect();
    // The last minute has no step row within 30 s and keeps the watch count.
    assert_eq!(steps, vec![Some(16.0), Some(128.0), Some(170.0)]);

    let health = data_loading::read_table(&out.join(output::HEALTH_METRICS_FILE)).unwrap();
    let avg_hr = health.column("avg_hr").unwrap();
    assert_eq!(health.rows[0][avg_hr], "108");
}
