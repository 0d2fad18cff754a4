use std::io;
use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};
use env_logger::Env;
use serde::Serialize;
use time::OffsetDateTime;

use crate::core::{OutputFormat, ScanRequest, Severity, VulnType, VulnerabilitySummary};
use crate::engine::{Engine, EngineOptions};
use crate::logs::TargetLog;
use crate::scanner::{ScanOutcome, ScanPayload};
use crate::ui::UiConfig;

#[derive(Debug, Parser)]
#[command(
    name = "trivy-offline",
    version,
    about = "Scan container images with Trivy against a locally staged vulnerability database"
)]
pub struct Cli {
    #[arg(long, global = true)]
    pub json: bool,
    #[arg(long = "no-color", global = true)]
    pub no_color: bool,
    /// Turn debugging information on
    #[arg(short, long, global = true, action(ArgAction::Count))]
    pub verbose: u8,
    /// Only print errors
    #[arg(short, long, global = true)]
    pub quiet: bool,
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// Seconds to wait for each runtime command (0 waits forever)
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Pull the database image and stage the database locally
    Setup,
    /// Re-pull the database image and replace the local database
    Update,
    /// Scan one image
    Scan(ScanArgs),
    /// Scan several images one after another
    Batch(BatchArgs),
    /// List locally cached images
    List,
    /// Show the local database
    Status,
    Completion(CompletionArgs),
    Config(ConfigArgs),
}

#[derive(Debug, Args)]
pub struct ScanArgs {
    pub image: String,
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
    #[arg(short, long, num_args = 1..)]
    pub severity: Vec<Severity>,
    #[arg(short = 't', long = "vuln-type", num_args = 1..)]
    pub vuln_type: Vec<VulnType>,
    /// File name under the results directory
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct BatchArgs {
    #[arg(required = true)]
    pub images: Vec<String>,
    #[arg(short, long, default_value = "json")]
    pub format: OutputFormat,
    #[arg(short, long, num_args = 1..)]
    pub severity: Vec<Severity>,
}

#[derive(Debug, Args)]
pub struct CompletionArgs {
    pub shell: String,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[arg(long)]
    pub show: bool,
}

#[derive(Debug, Serialize)]
struct ScanSummaryJson<'a> {
    image: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    saved_to: Option<String>,
    summary: VulnerabilitySummary,
}

#[derive(Debug, Serialize)]
struct BatchEntryJson<'a> {
    image: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<VulnerabilitySummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (false, 0) => "info",
        (false, _) => "debug",
    };
    let _ = env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .try_init();

    let stdout_is_tty = io::stdout().is_terminal();
    let stderr_is_tty = io::stderr().is_terminal();

    let home_dir = crate::platform::effective_home_dir().map_err(crate::exit::invalid_args_err)?;

    let env_config_path = std::env::var_os("TRIVY_OFFLINE_CONFIG").map(PathBuf::from);
    let mut cfg = crate::config::load(
        cli.config.as_deref().or(env_config_path.as_deref()),
        &home_dir,
    )
    .map_err(crate::exit::invalid_args_err)?;
    if let Some(timeout) = cli.timeout {
        cfg.runtime.timeout_secs = timeout;
    }

    let ui_cfg = UiConfig {
        color: stdout_is_tty && cfg.ui.color && !cli.no_color,
        stderr_is_tty,
        quiet: cli.quiet,
    };

    match &cli.command {
        Commands::Completion(args) => {
            let shell = parse_shell(&args.shell)?;
            let mut cmd = Cli::command();
            let mut out = std::io::stdout().lock();
            clap_complete::generate(shell, &mut cmd, "trivy-offline", &mut out);
            return Ok(());
        }
        Commands::Config(args) => {
            if args.show {
                if cli.json {
                    write_json(&cfg)?;
                } else {
                    println!("{}", toml::to_string_pretty(&cfg)?);
                }
            } else if !ui_cfg.quiet {
                eprintln!("config: use `trivy-offline config --show`");
            }
            return Ok(());
        }
        _ => {}
    }

    let engine = Engine::new(
        &cfg,
        EngineOptions {
            timeout: cfg.runtime.timeout(),
            show_progress: ui_cfg.stderr_is_tty && !cli.quiet && !cli.json,
        },
    )?;
    let logs_dir = cfg.paths.logs_dir();

    match cli.command {
        Commands::Setup => {
            let started_at = OffsetDateTime::now_utc();
            let res = engine.setup();
            record_db_run(&logs_dir, "setup", started_at, &cfg.images.database, &res);
            res.context("database setup failed")?;
        }
        Commands::Update => {
            let started_at = OffsetDateTime::now_utc();
            let res = engine.update();
            record_db_run(&logs_dir, "update", started_at, &cfg.images.database, &res);
            res.context("database update failed")?;
        }
        Commands::Scan(args) => {
            let req = ScanRequest::new(args.image.clone(), args.format)
                .with_severities(args.severity)
                .with_vuln_types(args.vuln_type)
                .with_output_file(args.output);

            let started_at = OffsetDateTime::now_utc();
            let res = engine.scan(&req);
            let mut entry = TargetLog::new(req.image.as_str());
            entry.format = Some(req.format.to_string());
            let outcome = match res {
                Ok(outcome) => {
                    entry.saved_to = outcome.saved_to.as_ref().map(|p| p.display().to_string());
                    entry.summary = outcome.json().map(crate::summary::summarize);
                    crate::logs::record_run(&logs_dir, "scan", started_at, vec![entry]);
                    outcome
                }
                Err(err) => {
                    crate::logs::record_run(
                        &logs_dir,
                        "scan",
                        started_at,
                        vec![entry.failed(&err)],
                    );
                    return Err(
                        anyhow::Error::new(err).context(format!("scan of {} failed", req.image))
                    );
                }
            };
            print_scan_outcome(&req, &outcome, cli.json, &ui_cfg)?;
        }
        Commands::Batch(args) => {
            let started_at = OffsetDateTime::now_utc();
            let results = engine.scan_many(&args.images, args.format, &args.severity);

            let mut entries = Vec::new();
            let mut json_rows = Vec::new();
            let mut rows = Vec::new();
            for (image, res) in &results {
                let mut entry = TargetLog::new(image.as_str());
                entry.format = Some(args.format.to_string());
                match res {
                    Ok(outcome) => {
                        let summary = outcome.json().map(crate::summary::summarize);
                        entry.summary = summary;
                        json_rows.push(BatchEntryJson {
                            image: image.as_str(),
                            summary,
                            error: None,
                        });
                        rows.push((image.as_str(), Ok(summary)));
                    }
                    Err(err) => {
                        entry = entry.failed(err);
                        json_rows.push(BatchEntryJson {
                            image: image.as_str(),
                            summary: None,
                            error: Some(err.to_string()),
                        });
                        rows.push((image.as_str(), Err(err.to_string())));
                    }
                }
                entries.push(entry);
            }
            crate::logs::record_run(&logs_dir, "batch", started_at, entries);

            if cli.json {
                write_json(&json_rows)?;
            } else {
                crate::ui::print_batch(&rows, &ui_cfg);
            }

            let failed = results.values().filter(|r| r.is_err()).count();
            if failed > 0 {
                anyhow::bail!("{failed} of {} image scans failed", results.len());
            }
        }
        Commands::List => {
            let images = engine.list_images();
            if cli.json {
                write_json(&images)?;
            } else {
                crate::ui::print_images(&images, &ui_cfg);
            }
        }
        Commands::Status => {
            let status = engine.status();
            if cli.json {
                write_json(&status)?;
            } else {
                crate::ui::print_status(&status, &ui_cfg);
            }
        }
        Commands::Completion(_) | Commands::Config(_) => {}
    }

    Ok(())
}

fn print_scan_outcome(
    req: &ScanRequest,
    outcome: &ScanOutcome,
    json: bool,
    ui_cfg: &UiConfig,
) -> Result<()> {
    match &outcome.payload {
        ScanPayload::Json(report) => {
            let summary = crate::summary::summarize(report);
            if json {
                write_json(&ScanSummaryJson {
                    image: &req.image,
                    saved_to: outcome.saved_to.as_ref().map(|p| p.display().to_string()),
                    summary,
                })?;
            } else {
                crate::ui::print_summary(&req.image, &summary, ui_cfg);
            }
        }
        ScanPayload::Text(text) => {
            if req.format == OutputFormat::Table || outcome.saved_to.is_none() {
                write_raw(text)?;
            }
        }
    }
    Ok(())
}

fn write_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    use std::io::Write;

    let buf = serde_json::to_vec_pretty(value)?;

    let mut stdout = std::io::stdout().lock();
    match stdout.write_all(&buf) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => return Ok(()),
        Err(err) => return Err(err.into()),
    }
    match stdout.write_all(b"\n") {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn write_raw(text: &str) -> Result<()> {
    use std::io::Write;

    let mut stdout = std::io::stdout().lock();
    match stdout.write_all(text.as_bytes()) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn record_db_run(
    logs_dir: &std::path::Path,
    command: &str,
    started_at: OffsetDateTime,
    image: &str,
    res: &Result<(), crate::error::ScanError>,
) {
    let entry = TargetLog::new(image);
    let entry = match res {
        Ok(()) => entry,
        Err(err) => entry.failed(err),
    };
    crate::logs::record_run(logs_dir, command, started_at, vec![entry]);
}

fn parse_shell(s: &str) -> Result<clap_complete::Shell> {
    let s = s.trim().to_ascii_lowercase();
    match s.as_str() {
        "bash" => Ok(clap_complete::Shell::Bash),
        "zsh" => Ok(clap_complete::Shell::Zsh),
        "fish" => Ok(clap_complete::Shell::Fish),
        other => Err(crate::exit::invalid_args(format!(
            "unsupported shell: {other} (expected bash|zsh|fish)"
        ))),
    }
}
