//! IngestRunner CLI Entry Point
//!
//! Loads workflow files, validates them and ticks the orchestrator on a
//! fixed interval until interrupted.
//!
//! # Usage
//!
//! ```bash
//! # Run the scheduler
//! INGEST_BUCKET=lake ingestrunner demos/taxi.yaml
//!
//! # Backfill every due window, then exit
//! ingestrunner demos/taxi.yaml --once --bucket lake
//!
//! # Show due windows and resolved parameters without executing
//! ingestrunner demos/taxi.yaml --dry-run --bucket lake
//!
//! # Re-run one window by hand
//! ingestrunner demos/taxi.yaml --once --trigger yellow_taxi_data=2019-03-02T06:00:00
//! ```

use std::env;
use std::error::Error;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use colored::Colorize;
use log::{error, info, warn};
use tokio::time::MissedTickBehavior;

use ingestrunner::config::DEFAULT_TICK_SECS;
use ingestrunner::execution::{Orchestrator, RunState, ThreadDispatcher, TickAction, TickReport, Trigger};
use ingestrunner::workflow::load_workflows;
use ingestrunner::{
    ActionRegistry, ConfigOverrides, LogicalWindow, ProcessConfig, Run, WorkflowRegistry, APP_NAME,
    VERSION,
};

/// Command-line configuration parsed from arguments.
#[derive(Debug, Default)]
struct Config {
    workflow_paths: Vec<String>,
    once: bool,
    dry_run: bool,
    verbose: bool,
    overrides: ConfigOverrides,
    triggers: Vec<(String, String)>,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("Scheduled Dataset Ingestion Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: ingestrunner [OPTIONS] <WORKFLOW_FILE>...");
    println!();
    println!("Arguments:");
    println!("  <WORKFLOW_FILE>...    One or more workflow YAML files");
    println!();
    println!("Options:");
    println!("  --once                Run until every due window is done, then exit");
    println!("  --dry-run             List due windows and resolved parameters only");
    println!("  --work-dir PATH       Local working directory (env: INGEST_HOME)");
    println!("  --bucket NAME         Destination bucket (env: INGEST_BUCKET)");
    println!("  --workers N           Maximum concurrent tasks (env: INGEST_WORKERS)");
    println!(
        "  --tick SECS           Seconds between ticks (env: INGEST_TICK_SECS, default: {})",
        DEFAULT_TICK_SECS
    );
    println!("  --trigger NAME=DATE   Queue a manual run of NAME for window DATE");
    println!("  --verbose             Enable debug logging");
    println!("  --help                Show this help message");
    println!("  --version             Show version information");
    println!();
    println!("Examples:");
    println!("  ingestrunner taxi.yaml --bucket lake");
    println!("  ingestrunner taxi.yaml --once --workers 8");
    println!("  ingestrunner taxi.yaml --dry-run --trigger zone_data=2021-05-01");
}

/// Returns the value following an option, advancing the cursor.
fn option_value<'a>(args: &'a [String], i: &mut usize, option: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires an argument", option))
}

/// Splits `NAME=DATE`.
fn parse_trigger(text: &str) -> Result<(String, String), String> {
    match text.split_once('=') {
        Some((name, date)) if !name.trim().is_empty() && !date.trim().is_empty() => {
            Ok((name.trim().to_string(), date.trim().to_string()))
        }
        _ => Err(format!("Invalid trigger '{}': expected NAME=DATE", text)),
    }
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--once" => config.once = true,
            "--dry-run" => config.dry_run = true,
            "--verbose" | "-v" => config.verbose = true,
            "--work-dir" => {
                let value = option_value(args, &mut i, "--work-dir")?;
                config.overrides.work_dir = Some(PathBuf::from(value));
            }
            "--bucket" => {
                let value = option_value(args, &mut i, "--bucket")?;
                config.overrides.bucket = Some(value.to_string());
            }
            "--workers" => {
                let value = option_value(args, &mut i, "--workers")?;
                config.overrides.workers = Some(
                    value
                        .parse()
                        .map_err(|_| format!("Invalid workers value: {}", value))?,
                );
            }
            "--tick" => {
                let value = option_value(args, &mut i, "--tick")?;
                config.overrides.tick_secs = Some(
                    value
                        .parse()
                        .map_err(|_| format!("Invalid tick value: {}", value))?,
                );
            }
            "--trigger" => {
                let value = option_value(args, &mut i, "--trigger")?;
                config.triggers.push(parse_trigger(value)?);
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => config.workflow_paths.push(arg.clone()),
        }
        i += 1;
    }

    if config.workflow_paths.is_empty() {
        return Err("At least one workflow file is required".to_string());
    }
    Ok(config)
}

/// Prints every due window with the parameters its tasks would receive.
fn print_plan(registry: &WorkflowRegistry, triggers: &[(String, String)]) -> Result<(), Box<dyn Error>> {
    let now = Utc::now();
    println!("{}", "[DRY RUN] Nothing will be executed".yellow().bold());

    for registered in registry.iter() {
        let schedule = &registered.definition.schedule;
        let mut windows: Vec<(LogicalWindow, Trigger)> = triggers
            .iter()
            .filter(|(name, _)| name == registered.name())
            .map(|(_, date)| LogicalWindow::parse(date).map(|w| (w, Trigger::Manual)))
            .collect::<Result<_, _>>()?;
        windows.extend(
            schedule
                .due_windows(now)
                .into_iter()
                .map(|w| (w, Trigger::Scheduled)),
        );

        println!();
        println!(
            "{} ({}, catchup: {}, max active runs: {})",
            registered.name().bold(),
            schedule.recurrence,
            schedule.catchup,
            schedule.max_active_runs
        );
        if windows.is_empty() {
            println!("  {}", "no due windows".dimmed());
            continue;
        }

        for (window, trigger) in windows {
            let run = Run::instantiate(registered, window, trigger, registry.variables(), now)?;
            println!("  {} [{}]", window.to_string().cyan(), trigger);
            for task in run.instances() {
                println!("    {} ({})", task.task_id, task.action);
                for (key, value) in &task.params {
                    println!("      {} = {}", key.dimmed(), value);
                }
            }
        }
    }
    Ok(())
}

/// Prints the outcome lines of a tick report.
fn print_report(report: &TickReport) {
    for action in &report.actions {
        let line = action.to_string();
        match action {
            TickAction::TaskDispatched { .. } => continue,
            TickAction::RunCreated { .. } => println!("{}", line.cyan()),
            TickAction::TaskSucceeded { .. } => println!("{}", line.green()),
            TickAction::RetryScheduled { .. } => println!("{}", line.yellow()),
            TickAction::TaskExhausted { .. } => println!("{}", line.red()),
            TickAction::RunFinished { state, .. } => match state {
                RunState::Succeeded => println!("{}", line.green().bold()),
                _ => println!("{}", line.red().bold()),
            },
        }
    }
}

/// Ticks until nothing is left to do. Used for backfills.
fn run_once(orchestrator: &mut Orchestrator, tick: Duration) -> Result<(), Box<dyn Error>> {
    let mut failed = 0;
    loop {
        let report = orchestrator.tick(Utc::now())?;
        print_report(&report);
        failed += report
            .runs_finished()
            .iter()
            .filter(|(_, _, state)| *state != RunState::Succeeded)
            .count();

        if orchestrator.is_idle() {
            break;
        }

        if orchestrator.in_flight() > 0 {
            orchestrator.wait_for_completion(tick)?;
        } else if let Some(retry_at) = orchestrator.next_retry_at() {
            let until = (retry_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            thread::sleep(until.min(tick));
        }
    }

    if failed > 0 {
        return Err(format!("{} run(s) failed", failed).into());
    }
    info!("All due windows processed");
    Ok(())
}

/// Ticks on a fixed interval until Ctrl-C.
async fn serve(mut orchestrator: Orchestrator, tick: Duration) -> Result<(), Box<dyn Error>> {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("Ticking every {:?} (Ctrl-C to stop)", tick);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let report = orchestrator.tick(Utc::now())?;
                print_report(&report);
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                let in_flight = orchestrator.in_flight();
                if in_flight > 0 {
                    warn!("Interrupted with {} task(s) in flight", in_flight);
                } else {
                    info!("Interrupted");
                }
                return Ok(());
            }
        }
    }
}

/// Main application entry point.
fn run() -> Result<(), Box<dyn Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let cli = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(cli.verbose);
    print_banner();

    let config = ProcessConfig::from_env(&cli.overrides)?;
    info!("Working directory: {}", config.work_dir.display());
    info!("Object store: {} (bucket '{}')", config.store, config.bucket);

    // Load and validate every workflow before anything runs
    let actions = Arc::new(ActionRegistry::with_defaults(&config));
    let mut registry = WorkflowRegistry::new(actions, config.variables());
    for path in &cli.workflow_paths {
        let definitions = load_workflows(path).map_err(|e| {
            error!("Failed to load workflows: {}", e);
            format!("Could not load workflows from '{}': {}", path, e)
        })?;
        registry.register_all(definitions)?;
    }
    info!("{} workflows registered: {}", registry.len(), registry.names().join(", "));

    if cli.dry_run {
        return print_plan(&registry, &cli.triggers);
    }

    fs::create_dir_all(&config.work_dir)?;

    let dispatcher = ThreadDispatcher::new(config.workers);
    let mut orchestrator = Orchestrator::new(Arc::new(registry), Box::new(dispatcher));
    for (name, date) in &cli.triggers {
        orchestrator.trigger(name, LogicalWindow::parse(date)?)?;
    }

    if cli.once {
        return run_once(&mut orchestrator, config.tick);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(orchestrator, config.tick))
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("ingestrunner")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_arguments() {
        let config = parse_arguments(&args(&[
            "taxi.yaml",
            "--once",
            "--workers",
            "3",
            "--tick",
            "5",
            "--bucket",
            "lake",
            "--trigger",
            "zone_data=2021-05-01",
            "more.yaml",
        ]))
        .unwrap();

        assert_eq!(config.workflow_paths, vec!["taxi.yaml", "more.yaml"]);
        assert!(config.once);
        assert!(!config.dry_run);
        assert_eq!(config.overrides.workers, Some(3));
        assert_eq!(config.overrides.tick_secs, Some(5));
        assert_eq!(config.overrides.bucket.as_deref(), Some("lake"));
        assert_eq!(
            config.triggers,
            vec![("zone_data".to_string(), "2021-05-01".to_string())]
        );
    }

    #[test]
    fn test_parse_arguments_errors() {
        assert!(parse_arguments(&args(&[])).is_err());
        assert!(parse_arguments(&args(&["taxi.yaml", "--workers"])).is_err());
        assert!(parse_arguments(&args(&["taxi.yaml", "--workers", "many"])).is_err());
        assert!(parse_arguments(&args(&["taxi.yaml", "--parallel", "2"])).is_err());
    }

    #[test]
    fn test_parse_trigger() {
        assert_eq!(
            parse_trigger("yellow_taxi_data = 2019-03").unwrap(),
            ("yellow_taxi_data".to_string(), "2019-03".to_string())
        );
        assert!(parse_trigger("yellow_taxi_data").is_err());
        assert!(parse_trigger("=2019-03").is_err());
    }
}
