//! Extract VK Video links from a saved HTML page into a list file.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use vkvideo_dl::{extract_video_urls, read_html, write_url_list};

/// Extract unique VK Video URLs from an HTML dump
#[derive(Parser, Debug)]
#[command(name = "parse-dump")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Saved HTML page
    html: PathBuf,

    /// Output list file (default: stdout)
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// Only keep videos of this owner id, e.g. 4725344 or -1719791
    #[arg(long, allow_hyphen_values = true)]
    owner: Option<String>,

    /// Only print the number of URLs
    #[arg(long)]
    count: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if !args.html.exists() {
        eprintln!("Error: {} not found", args.html.display());
        return ExitCode::FAILURE;
    }

    let html = match read_html(&args.html) {
        Ok(html) => html,
        Err(e) => {
            eprintln!("Error: cannot read {}: {}", args.html.display(), e);
            return ExitCode::FAILURE;
        }
    };
    let urls = extract_video_urls(&html, args.owner.as_deref());

    if args.count {
        println!("{}", urls.len());
        return ExitCode::SUCCESS;
    }

    match &args.output {
        Some(path) => {
            if let Err(e) = write_url_list(path, &urls) {
                eprintln!("Error: cannot write {}: {}", path.display(), e);
                return ExitCode::FAILURE;
            }
            eprintln!("Saved {} URLs to {}", urls.len(), path.display());
        }
        None => {
            for url in &urls {
                println!("{}", url);
            }
            eprintln!("\n# Total: {} unique videos", urls.len());
        }
    }
    ExitCode::SUCCESS
}
