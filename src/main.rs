use std::path::Path;

use anyhow::Context;
use chrono::Duration;
use clap::Parser;
use log::{info, warn};

use march_cadence::config::{
    Args, CadenceConfig, Command, CrossingConfig, MergeConfig, StepRunConfig, WatchRunConfig,
};
use march_cadence::data_loading::{self, parse_timestamp};
use march_cadence::merge::{self, StepRow, WatchTable};
use march_cadence::{gps, output, steps, watch};

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    match args.command {
        Command::Steps {
            data_dir,
            march_id,
            window_size,
            march_start_time,
            gps_trim_file,
            clock_offset_hours,
            output,
        } => {
            let mut config = StepRunConfig::new(march_id, data_dir);
            config.cadence = CadenceConfig {
                window_seconds: window_size,
                ..CadenceConfig::default()
            };
            config.clock_offset = Duration::hours(clock_offset_hours);

            if let Some(start) = march_start_time {
                let start = parse_timestamp(&start)
                    .with_context(|| format!("Invalid march start time format: {start}"))?;
                info!("Using march start time: {start}");
                config.march_start = Some(start);
            }
            if let Some(path) = gps_trim_file {
                config.crossings = data_loading::read_crossing_times(&path)
                    .with_context(|| format!("Failed to read GPS trim file {}", path.display()))?;
                info!(
                    "Loaded GPS crossing times for {} participants from {}",
                    config.crossings.len(),
                    path.display()
                );
            }

            info!("Starting processing with window size: {window_size} seconds");
            let run = steps::run(&config)?;
            if run.timelines.is_empty() {
                anyhow::bail!("No data was successfully processed");
            }
            output::write_step_outputs(&output, march_id, config.march_start, &run.timelines)?;

            info!("Processing complete! Output saved to {}", output.display());
            println!(
                "Processed {} participants, {} excluded",
                run.timelines.len(),
                run.excluded.len()
            );
            if !run.excluded.is_empty() {
                warn!("Excluded participants: {}", run.excluded.join(", "));
            }
        }

        Command::Watch {
            data_dir,
            march_id,
            march_start_time,
            start_coords,
            end_coords,
            gps_tolerance,
            output,
        } => {
            let mut config = WatchRunConfig::new(march_id, data_dir);
            if let Some(start) = march_start_time {
                let start = parse_timestamp(&start)
                    .with_context(|| format!("Invalid march start time format: {start}"))?;
                config.march_start = Some(start);
            }
            config.crossing = CrossingConfig {
                start: start_coords,
                end: end_coords,
                tolerance_m: gps_tolerance,
            };
            if start_coords.is_some() || end_coords.is_some() {
                info!("GPS trimming tolerance: {gps_tolerance}m");
            }

            let run = watch::run(&config)?;
            if run.participants.is_empty() {
                anyhow::bail!("No data was successfully processed");
            }
            output::write_watch_outputs(&output, march_id, &run)?;
            info!("Processing complete! Output saved to {}", output.display());
            println!("Processed {} participants", run.participants.len());
        }

        Command::Crossings {
            data_dir,
            start_coords,
            end_coords,
            gps_tolerance,
            output,
        } => {
            let config = CrossingConfig {
                start: start_coords,
                end: end_coords,
                tolerance_m: gps_tolerance,
            };
            let crossings = gps::locate_crossings(&data_dir, &config)?;
            output::write_crossings(&output, &crossings)?;
        }

        Command::Merge {
            watch_data,
            step_data,
            watch_summary,
            step_summary,
            merge_on,
            tolerance,
            output,
        } => {
            let config = MergeConfig::new(merge_on, tolerance);

            let watch = WatchTable::read(&watch_data)
                .with_context(|| format!("Failed to load watch data {}", watch_data.display()))?;
            info!("Loaded {} watch data records", watch.rows.len());
            let step_rows: Vec<StepRow> = data_loading::read_records(&step_data)
                .with_context(|| format!("Failed to load step data {}", step_data.display()))?;
            info!("Loaded {} step data records", step_rows.len());

            let merged = merge::merge_timelines(watch, &step_rows, &config);
            output::write_merged_timeline(&output, &merged)?;

            if let Some(health) = watch_summary.as_deref() {
                merge_summary_files(health, step_summary.as_deref(), &output)?;
            } else {
                warn!("No watch summary file provided - skipping summary merge");
            }
        }
    }

    Ok(())
}

fn merge_summary_files(
    health: &Path,
    step_summary: Option<&Path>,
    output: &Path,
) -> anyhow::Result<()> {
    let health = data_loading::read_table(health)
        .with_context(|| format!("Failed to load health metrics {}", health.display()))?;
    info!("Loaded {} health metrics records", health.rows.len());

    let merged = match step_summary {
        Some(path) => {
            let summary = data_loading::read_table(path)
                .with_context(|| format!("Failed to load step summary {}", path.display()))?;
            merge::merge_summaries(health, &summary)
        }
        None => {
            info!("No step summary file - using health metrics only");
            health
        }
    };
    output::write_table(output, output::MERGED_SUMMARY_FILE, &merged)?;
    Ok(())
}
