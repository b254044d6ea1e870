use clap::{Parser, Subcommand};
use runwatch::artifact::FallbackCorroborator;
use runwatch::config::{self, HooksConfig, WatchConfig};
use runwatch::hooks::CommandDriver;
use runwatch::observer::{Observers, RunObserver, TracingObserver};
use runwatch::orchestrator::{Orchestrator, RunInput, RunReport, RunStatus};
use runwatch::signal_source::{SignalSource, Snapshot, SystemSignalSource};
use runwatch::signals::{self, ShutdownFlag};
use runwatch::status::StatusObserver;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Watches an external application for the start and completion of opaque
/// computations, using sockets on a local port, matching worker processes
/// and their CPU usage.
#[derive(Parser, Debug)]
#[command(name = "runwatch", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Config file path
    #[arg(short, long, global = true, default_value = "runwatch.toml")]
    config: PathBuf,

    /// Local port the application talks to its workers on (overrides config)
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Worker process name substring (overrides config)
    #[arg(long = "process", global = true)]
    process: Option<String>,

    /// Wait timeout in seconds (overrides config)
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Poll interval in milliseconds (overrides config)
    #[arg(long = "poll-ms", global = true)]
    poll_ms: Option<u64>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Extra logging (hysteresis resets, hook exits)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only warnings, errors and the summary
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Monitor a single run started by someone else
    Watch {
        /// Label used in logs, the status file and `{stem}`
        #[arg(long, default_value = "run")]
        label: String,

        /// Artifact name fragment (overrides the config template)
        #[arg(long)]
        fragment: Option<String>,
    },
    /// Start, wait for and export one run per input using the configured hooks
    Run {
        /// Input files, or directories expanded with --glob
        #[arg(value_name = "INPUTS", required = true)]
        inputs: Vec<PathBuf>,

        /// Pattern applied inside directory inputs
        #[arg(long, default_value = "*.set")]
        glob: String,
    },
    /// Print the current port and process snapshot
    Snapshot,
    /// Run one fallback artifact check
    CheckArtifact {
        /// Expected substring of the artifact file name
        #[arg(long)]
        fragment: String,
    },
    /// Print the resolved configuration and exit
    Config,
}

/// Exit code when a run timed out, failed to start, or failed to export.
const EXIT_INCOMPLETE: i32 = 2;
const EXIT_CANCELLED: i32 = 130;
const EXIT_CONFIG: i32 = 1;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);
    tracing::debug!(?cli, "parsed CLI arguments");

    let config = match resolve_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "configuration error");
            std::process::exit(EXIT_CONFIG);
        }
    };

    let code = match cli.command {
        Command::Config => print_config(&config),
        Command::Snapshot => print_snapshot(&config, cli.json),
        Command::CheckArtifact { ref fragment } => check_artifact(&config, fragment, cli.json),
        Command::Watch {
            ref label,
            ref fragment,
        } => {
            let template = fragment
                .clone()
                .unwrap_or_else(|| config.artifact.fragment.clone());
            let run = RunInput::labelled(label, &template);
            let hooks = HooksConfig {
                start: Vec::new(),
                export: Vec::new(),
                ..config.hooks.clone()
            };
            run_engine(config, hooks, vec![run], cli.json).await
        }
        Command::Run {
            ref inputs,
            ref glob,
        } => {
            let runs: Vec<RunInput> = expand_inputs(inputs, glob)
                .iter()
                .map(|p| RunInput::from_path(p, &config.artifact.fragment))
                .collect();
            if runs.is_empty() {
                tracing::error!("no input files found");
                std::process::exit(EXIT_CONFIG);
            }
            let hooks = config.hooks.clone();
            run_engine(config, hooks, runs, cli.json).await
        }
    };
    std::process::exit(code);
}

fn init_tracing(verbose: bool, quiet: bool) {
    let default_level = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Load the config file and apply CLI overrides.
fn resolve_config(cli: &Cli) -> Result<WatchConfig, config::ConfigError> {
    let mut config = config::load_config(&cli.config)?;
    if let Some(port) = cli.port {
        config.detector.port = port;
    }
    if let Some(process) = &cli.process {
        config.detector.process_pattern = process.clone();
    }
    if let Some(timeout) = cli.timeout {
        config.wait.timeout_secs = timeout;
    }
    if let Some(poll_ms) = cli.poll_ms {
        config.wait.poll_interval_ms = poll_ms;
    }
    config.validate()?;
    Ok(config)
}

/// Files given directly are kept in order; directories contribute their
/// matches for `pattern`, sorted by name.
fn expand_inputs(inputs: &[PathBuf], pattern: &str) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for input in inputs {
        if !input.is_dir() {
            out.push(input.clone());
            continue;
        }
        let full = format!(
            "{}/{}",
            glob::Pattern::escape(&input.to_string_lossy()).trim_end_matches('/'),
            pattern
        );
        match glob::glob(&full) {
            Ok(paths) => {
                let mut found: Vec<PathBuf> = paths.flatten().filter(|p| p.is_file()).collect();
                found.sort();
                if found.is_empty() {
                    tracing::warn!(dir = %input.display(), pattern, "no inputs matched");
                }
                out.extend(found);
            }
            Err(e) => tracing::warn!(error = %e, pattern = %full, "invalid input glob"),
        }
    }
    out
}

async fn run_engine(
    config: WatchConfig,
    hooks: HooksConfig,
    runs: Vec<RunInput>,
    json: bool,
) -> i32 {
    let shutdown = ShutdownFlag::new().with_stop_file(&config.shutdown.stop_file);
    signals::install(shutdown.clone());

    let status = config
        .status
        .file
        .clone()
        .map(|path| Arc::new(StatusObserver::new(path)));
    let mut observers = Observers::new().with(Arc::new(TracingObserver));
    if let Some(s) = &status {
        observers = observers.with(s.clone());
    }
    let observer: Arc<dyn RunObserver> = Arc::new(observers);

    let engine_shutdown = shutdown.clone();
    let joined = tokio::task::spawn_blocking(move || {
        let source = SystemSignalSource::new(config.detector.cpu_sample_window());
        let driver = CommandDriver::new(hooks, engine_shutdown.clone());
        let mut orchestrator =
            Orchestrator::new(&config, source, driver, observer, engine_shutdown);
        if let Some(s) = &status {
            orchestrator = orchestrator.with_status(s.clone());
        }
        let reports = orchestrator.run_batch(&runs);
        if let Some(s) = &status {
            s.file().remove();
        }
        reports
    })
    .await;

    let reports = match joined {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(error = %e, "engine task failed");
            return EXIT_INCOMPLETE;
        }
    };

    print_reports(&reports, json);
    exit_code(&reports, shutdown.is_requested())
}

fn exit_code(reports: &[RunReport], shutdown_requested: bool) -> i32 {
    if shutdown_requested || reports.iter().any(|r| r.status == RunStatus::Cancelled) {
        return EXIT_CANCELLED;
    }
    if reports
        .iter()
        .all(|r| r.finished() && r.export_error.is_none())
    {
        0
    } else {
        EXIT_INCOMPLETE
    }
}

fn print_reports(reports: &[RunReport], json: bool) {
    if json {
        match serde_json::to_string_pretty(reports) {
            Ok(s) => println!("{s}"),
            Err(e) => tracing::error!(error = %e, "failed to serialize reports"),
        }
        return;
    }
    for r in reports {
        let method = r
            .method
            .map(|m| m.to_string())
            .unwrap_or_else(|| "-".to_string());
        let duration = r
            .duration_secs
            .map(|d| format!("{d:.1}s"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<32} {:<13} method={:<18} duration={:<8} elapsed={:.1}s",
            r.input, r.status.to_string(), method, duration, r.elapsed_secs
        );
        if let Some(e) = &r.start_error {
            println!("    start error: {e}");
        }
        if let Some(e) = &r.export_error {
            println!("    export error: {e}");
        }
    }
    let finished = reports.iter().filter(|r| r.finished()).count();
    println!("{finished}/{} runs finished", reports.len());
}

fn print_config(config: &WatchConfig) -> i32 {
    match toml::to_string_pretty(config) {
        Ok(s) => {
            print!("{s}");
            0
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to render config");
            EXIT_CONFIG
        }
    }
}

fn print_snapshot(config: &WatchConfig, json: bool) -> i32 {
    let mut source = SystemSignalSource::new(config.detector.cpu_sample_window());
    let snapshot = source.snapshot(config.detector.port, &config.detector.process_pattern);
    if json {
        match serde_json::to_string_pretty(&snapshot) {
            Ok(s) => println!("{s}"),
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize snapshot");
                return EXIT_INCOMPLETE;
            }
        }
    } else {
        print_snapshot_text(config, &snapshot);
    }
    0
}

fn print_snapshot_text(config: &WatchConfig, snapshot: &Snapshot) {
    println!(
        "port {}: {} socket(s), established={}",
        config.detector.port,
        snapshot.ports.connections.len(),
        snapshot.ports.has_established
    );
    for c in &snapshot.ports.connections {
        let remote = c
            .remote
            .map(|r| r.to_string())
            .unwrap_or_else(|| "-".to_string());
        let pid = c.pid.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string());
        println!("  {:<12} {} -> {} pid={}", c.status, c.local, remote, pid);
    }
    println!(
        "processes matching '{}': {}",
        config.detector.process_pattern,
        snapshot.processes.len()
    );
    for p in &snapshot.processes.processes {
        println!("  {:>7} {:<24} cpu={:.1}%", p.pid, p.name, p.cpu_percent);
    }
}

fn check_artifact(config: &WatchConfig, fragment: &str, json: bool) -> i32 {
    let corroborator = FallbackCorroborator::from_config(&config.artifact);
    let found = corroborator.find(
        fragment,
        config.artifact.min_size_bytes,
        config.artifact.max_age(),
    );
    if json {
        let value = serde_json::json!({
            "dir": corroborator.dir(),
            "fragment": fragment,
            "found": found.as_ref().map(|m| &m.path),
            "size": found.as_ref().map(|m| m.size),
            "age_secs": found.as_ref().map(|m| m.age.as_secs_f64()),
        });
        println!("{value}");
    } else {
        match &found {
            Some(m) => println!(
                "found {} ({} bytes, {:.0}s old)",
                m.path.display(),
                m.size,
                m.age.as_secs_f64()
            ),
            None => println!(
                "no artifact matching '{}' in {}",
                fragment,
                corroborator.dir().display()
            ),
        }
    }
    if found.is_some() {
        0
    } else {
        EXIT_INCOMPLETE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::tempdir;

    fn report(status: RunStatus) -> RunReport {
        RunReport {
            input: "a.set".to_string(),
            status,
            method: None,
            detected_pid: None,
            duration_secs: None,
            elapsed_secs: 1.0,
            start_error: None,
            export_error: None,
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(&[report(RunStatus::Finished)], false), 0);
        assert_eq!(
            exit_code(
                &[report(RunStatus::Finished), report(RunStatus::TimedOut)],
                false
            ),
            EXIT_INCOMPLETE
        );
        assert_eq!(exit_code(&[report(RunStatus::StartFailed)], false), EXIT_INCOMPLETE);
        assert_eq!(exit_code(&[report(RunStatus::Cancelled)], false), EXIT_CANCELLED);
        assert_eq!(exit_code(&[], true), EXIT_CANCELLED);

        let mut failed_export = report(RunStatus::Finished);
        failed_export.export_error = Some("boom".to_string());
        assert_eq!(exit_code(&[failed_export], false), EXIT_INCOMPLETE);
    }

    #[test]
    fn test_cli_overrides_config_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("runwatch.toml");
        std::fs::write(&path, "[detector]\nport = 4000\n").unwrap();
        let cli = Cli::parse_from([
            "runwatch",
            "--config",
            path.to_str().unwrap(),
            "--process",
            "worker",
            "--timeout",
            "60",
            "watch",
        ]);
        let config = resolve_config(&cli).unwrap();
        assert_eq!(config.detector.port, 4000);
        assert_eq!(config.detector.process_pattern, "worker");
        assert_eq!(config.wait.timeout_secs, 60);
    }

    #[test]
    fn test_zero_poll_override_rejected() {
        let cli = Cli::parse_from([
            "runwatch",
            "--config",
            "/nonexistent.toml",
            "--poll-ms",
            "0",
            "config",
        ]);
        assert!(resolve_config(&cli).is_err());
    }

    #[test]
    fn test_expand_inputs_mixes_files_and_dirs() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("b.set"), "").unwrap();
        std::fs::write(dir.path().join("a.set"), "").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "").unwrap();
        let explicit = PathBuf::from("/elsewhere/z.set");

        let found = expand_inputs(&[explicit.clone(), dir.path().to_path_buf()], "*.set");
        assert_eq!(
            found,
            vec![explicit, dir.path().join("a.set"), dir.path().join("b.set")]
        );
    }
}
