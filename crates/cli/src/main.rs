//! CLI entry point for the VK Video batch downloader
//!
//! Builds the configuration (defaults, config file, environment, flags),
//! runs the pre-flight checks and drives one batch run, dry run or format
//! listing.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vkvideo_dl::config::{Browser, ConfigError, Quality};
use vkvideo_dl::{
    collect_inputs, render_dry_run, run_preflight, BatchController, BatchError, Config, RunStatus,
};

const EXIT_FAILURES: u8 = 1;
const EXIT_SETUP: u8 = 2;
const EXIT_INTERRUPTED: u8 = 130;

/// Batch downloader for VK Video (vkvideo.ru / vk.com) built on yt-dlp
#[derive(Parser, Debug)]
#[command(name = "vkvideo-dl")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Video, channel or playlist URLs
    urls: Vec<String>,

    /// File with one URL per line (# starts a comment)
    #[arg(short = 'f', long = "file")]
    file: Option<PathBuf>,

    /// Download directory
    #[arg(short = 'o', long = "output-dir")]
    output_dir: Option<PathBuf>,

    /// Quality: best, 1080, 720, 480, 360, worst
    #[arg(short = 'q', long, value_parser = parse_quality)]
    quality: Option<Quality>,

    /// Concurrent downloads (0 = derive from CPU count)
    #[arg(short = 'c', long = "concurrent")]
    concurrent: Option<u32>,

    /// Browser to read cookies from (chrome, firefox, edge, safari, ...)
    #[arg(long, value_parser = parse_browser, conflicts_with = "cookies_file")]
    cookies_browser: Option<Browser>,

    /// Netscape-format cookies file
    #[arg(long)]
    cookies_file: Option<PathBuf>,

    /// Bandwidth limit, e.g. 5M or 500K
    #[arg(long)]
    rate_limit: Option<String>,

    /// Download items even if they are already in the archive
    #[arg(long)]
    no_archive: bool,

    /// List available formats and exit
    #[arg(long, conflicts_with = "dry_run")]
    list_formats: bool,

    /// Show what would be downloaded without downloading
    #[arg(long)]
    dry_run: bool,

    /// Configuration file (default: vkvideo-dl.toml if present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Skip the yt-dlp / ffmpeg availability checks
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Debug logging
    #[arg(short = 'v', long, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log errors
    #[arg(long)]
    quiet: bool,
}

fn parse_quality(s: &str) -> Result<Quality, String> {
    s.parse().map_err(|e: ConfigError| e.to_string())
}

fn parse_browser(s: &str) -> Result<Browser, String> {
    s.parse().map_err(|e: ConfigError| e.to_string())
}

/// Command line flags win over every other configuration layer.
fn apply_cli_overrides(args: &Args, config: &mut Config) {
    if let Some(dir) = &args.output_dir {
        config.download.output_dir = dir.clone();
    }
    if let Some(quality) = args.quality {
        config.download.quality = quality;
    }
    if let Some(n) = args.concurrent {
        config.download.max_concurrent = n;
    }
    if let Some(rate) = &args.rate_limit {
        config.download.rate_limit = Some(rate.clone());
    }
    if let Some(browser) = args.cookies_browser {
        config.auth.cookies_browser = Some(browser);
        config.auth.cookies_file = None;
    }
    if let Some(file) = &args.cookies_file {
        config.auth.cookies_file = Some(file.clone());
    }
    if args.no_archive {
        config.archive.enabled = false;
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(filter)
        .init();
}

fn build_config(args: &Args) -> Result<Config, ConfigError> {
    let mut config = Config::load_layered(args.config.as_deref())?;
    apply_cli_overrides(args, &mut config);
    config.validate()?;
    Ok(config)
}

fn print_banner(inputs: usize, config: &Config, concurrency: usize) {
    println!("VK Video Downloader");
    println!("  URLs: {}", inputs);
    println!("  Output: {}", config.download.output_dir.display());
    println!("  Quality: {}", config.download.quality);
    println!("  Concurrency: {}", concurrency);
    if !config.archive.enabled {
        println!("  Archive: ignored for this run");
    }
    println!();
}

const INTERRUPT_MESSAGE: &str = "interrupt received, stopping; in-flight downloads will be aborted";

/// Cancel `token` on the first Ctrl-C.
fn spawn_interrupt_watcher(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("{}", INTERRUPT_MESSAGE);
            token.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            eprintln!("Configuration error: {}", e);
            return ExitCode::from(EXIT_SETUP);
        }
    };

    let inputs = match collect_inputs(&args.urls, args.file.as_deref()) {
        Ok(inputs) => inputs,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::from(EXIT_SETUP);
        }
    };

    if args.skip_checks {
        warn!("skipping pre-flight checks (--skip-checks enabled)");
    } else if let Err(e) = run_preflight(&config) {
        eprintln!("{}", BatchError::from(e));
        return ExitCode::from(EXIT_SETUP);
    }

    let controller = match BatchController::from_config(&config) {
        Ok(controller) => controller.with_progress(!args.quiet),
        Err(e) => {
            eprintln!("Failed to initialize: {}", e);
            return ExitCode::from(EXIT_SETUP);
        }
    };

    print_banner(inputs.len(), &config, controller.concurrency());

    let cancel = CancellationToken::new();
    spawn_interrupt_watcher(cancel.clone());

    if args.list_formats {
        for listing in controller.list_formats(&inputs).await {
            println!("\n{}", listing.url);
            match listing.result {
                Ok(table) => print!("{}", table),
                Err(e) => eprintln!("  {}", e),
            }
        }
        return ExitCode::SUCCESS;
    }

    if args.dry_run {
        let entries = controller.dry_run(&inputs, &cancel).await;
        print!("{}", render_dry_run(&entries));
        return ExitCode::SUCCESS;
    }

    let started = Instant::now();
    let outcome = match controller.run(&inputs, &cancel).await {
        Ok(outcome) => outcome,
        Err(e) => {
            eprintln!("Run aborted: {}", e);
            return ExitCode::from(EXIT_SETUP);
        }
    };

    println!();
    print!("{}", outcome.render());
    if let Some(path) = &outcome.log_path {
        println!("Log: {}", path.display());
    }
    println!("Completed in {:.1}s", started.elapsed().as_secs_f64());

    match outcome.status() {
        RunStatus::Clean => ExitCode::SUCCESS,
        RunStatus::Failures => ExitCode::from(EXIT_FAILURES),
        RunStatus::Interrupted => {
            eprintln!(
                "Interrupted: {} of the planned downloads were dispatched; re-run to resume",
                outcome.dispatched
            );
            ExitCode::from(EXIT_INTERRUPTED)
        }
    }
}
