mod core;
mod dispatch;
mod protocol;

use crate::core::manager::{Manager, ManagerConfig};
use crate::core::model::{DownloadRequest, TransferContext};
use crate::dispatch::{Dispatcher, Notice};
use anyhow::Context;
use clap::{Arg, ArgAction, ArgMatches, Command};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use sanitize_filename::sanitize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;
use url::Url;

fn tuning_args(cmd: Command) -> Command {
    cmd.arg(
        Arg::new("concurrency")
            .long("concurrency")
            .help("Max simultaneous transfers; extra requests queue")
            .default_value("6")
            .num_args(1),
    )
    .arg(
        Arg::new("chunk_mb")
            .long("chunk-mb")
            .help("Progress granularity in MB")
            .default_value("1")
            .num_args(1),
    )
    .arg(
        Arg::new("timeout")
            .long("timeout")
            .help("Seconds to wait for response headers; the body itself has no deadline")
            .default_value("60")
            .num_args(1),
    )
    .arg(
        Arg::new("retries")
            .long("retries")
            .help("Retries for connect failures and retryable statuses")
            .default_value("2")
            .num_args(1),
    )
    .arg(
        Arg::new("user_agent")
            .long("user-agent")
            .default_value("pipefetch/0.1")
            .num_args(1),
    )
}

fn build_cli() -> Command {
    let serve = tuning_args(
        Command::new("serve")
            .about("Run the download manager: JSON commands on stdin, JSON events on stdout"),
    );

    let fetch = tuning_args(
        Command::new("fetch")
            .about("Download one or more URLs directly")
            .arg(
                Arg::new("links")
                    .help("URLs to download")
                    .action(ArgAction::Append)
                    .num_args(1..)
                    .required(true),
            )
            .arg(
                Arg::new("out_dir")
                    .long("out-dir")
                    .help("Output directory")
                    .default_value("./downloads")
                    .num_args(1),
            ),
    );

    Command::new("pipefetch")
        .about("Concurrent download engine driven over a line protocol")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(serve)
        .subcommand(fetch)
}

fn config_from(m: &ArgMatches) -> anyhow::Result<ManagerConfig> {
    let concurrency: usize = m.get_one::<String>("concurrency").unwrap().parse()?;
    let chunk_mb: u64 = m.get_one::<String>("chunk_mb").unwrap().parse()?;
    let timeout: u64 = m.get_one::<String>("timeout").unwrap().parse()?;
    let retries: u32 = m.get_one::<String>("retries").unwrap().parse()?;
    let user_agent = m.get_one::<String>("user_agent").unwrap().clone();
    Ok(ManagerConfig {
        concurrency,
        transfer: TransferContext {
            user_agent,
            timeout_secs: timeout,
            retries,
            chunk_size: (chunk_mb * 1024 * 1024).max(1),
            ..Default::default()
        },
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout belongs to the protocol; diagnostics go to stderr only.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let matches = build_cli().get_matches();
    match matches.subcommand() {
        Some(("serve", m)) => {
            let manager = Manager::new(config_from(m)?, tokio::io::stdout())?;
            manager.run(BufReader::new(tokio::io::stdin())).await
        }
        Some(("fetch", m)) => fetch(m).await,
        _ => unreachable!("subcommand required"),
    }
}

/// Turns CLI links into inbound request lines. Every link is validated with
/// the same rules the manager applies, so nothing submitted here gets
/// rejected later and session indices always line up with link order (bar
/// labels and the summary are keyed by that).
fn build_request_lines(links: &[String], out_dir: &Path) -> anyhow::Result<(String, Vec<String>)> {
    let mut input = String::new();
    let mut names: Vec<String> = Vec::new();
    for link in links {
        let url = Url::parse(link).with_context(|| format!("parse url {link}"))?;
        let filename = url
            .path_segments()
            .and_then(|s| s.last())
            .filter(|s| !s.is_empty())
            .map(sanitize)
            .unwrap_or_else(|| "download.bin".to_string());
        let path = out_dir.join(&filename);
        DownloadRequest::validate(link, &path.to_string_lossy())
            .with_context(|| format!("unusable link {link}"))?;
        input.push_str(&serde_json::json!({ "url": link, "path": path }).to_string());
        input.push('\n');
        names.push(filename);
    }
    Ok((input, names))
}

/// One-shot mode: feeds synthesized request lines through the same manager
/// and renders the event stream as per-index progress bars.
async fn fetch(m: &ArgMatches) -> anyhow::Result<()> {
    let out_dir: PathBuf = m.get_one::<String>("out_dir").unwrap().into();
    tokio::fs::create_dir_all(&out_dir)
        .await
        .with_context(|| format!("create out dir {}", out_dir.display()))?;

    let links: Vec<String> = m.get_many::<String>("links").unwrap().cloned().collect();
    let (input, names) = build_request_lines(&links, &out_dir)?;

    let (out_wr, out_rd) = tokio::io::duplex(64 * 1024);
    let manager = Manager::new(config_from(m)?, out_wr)?;
    let run = tokio::spawn(async move {
        let result = manager.run(BufReader::new(std::io::Cursor::new(input))).await;
        drop(manager);
        result
    });

    let mp = MultiProgress::new();
    let sty = ProgressStyle::with_template("{prefix} {bar:40.cyan/blue} {pos:>3}% {wide_msg}")
        .expect("static template");

    let mut dispatcher = Dispatcher::new();
    let mut bars: HashMap<i64, ProgressBar> = HashMap::new();
    let mut failures = 0usize;
    let mut lines = BufReader::new(out_rd).lines();
    while let Some(line) = lines.next_line().await? {
        let notice = dispatcher.handle_line(&line);

        for (index, view) in dispatcher.sessions() {
            let bar = bars.entry(index).or_insert_with(|| {
                let pb = mp.add(ProgressBar::new(100));
                pb.set_style(sty.clone());
                let name = usize::try_from(index)
                    .ok()
                    .and_then(|i| names.get(i).cloned())
                    .unwrap_or_else(|| "?".to_string());
                pb.set_prefix(format!("[{name}]"));
                pb
            });
            bar.set_position(view.progress as u64);
        }

        match notice {
            Some(Notice::Completed { index }) => {
                if let Some(bar) = bars.get(&index) {
                    bar.finish_with_message("done");
                }
            }
            Some(Notice::Cancelled { index }) => {
                if let Some(bar) = bars.get(&index) {
                    bar.finish_with_message("cancelled");
                }
            }
            Some(Notice::Failed { index, error }) => {
                failures += 1;
                if let Some(bar) = bars.get(&index) {
                    bar.finish_with_message(format!("failed: {error}"));
                }
            }
            Some(Notice::Rejected { error }) => {
                failures += 1;
                let _ = mp.println(format!("rejected: {error}"));
            }
            None => {}
        }
    }

    run.await??;

    println!("Summary:");
    let mut finished: Vec<_> = dispatcher.sessions().collect();
    finished.sort_by_key(|(index, _)| *index);
    for (index, view) in finished {
        let name = usize::try_from(index)
            .ok()
            .and_then(|i| names.get(i).cloned())
            .unwrap_or_else(|| "?".to_string());
        match (&view.finished, &view.error) {
            (Some(protocol::Status::Error), Some(error)) => {
                println!("- {name}: failed ({error})")
            }
            (Some(status), _) => println!("- {name}: {status:?} ({}%)", view.progress),
            (None, _) => println!("- {name}: incomplete ({}%)", view.progress),
        }
    }

    if failures > 0 {
        anyhow::bail!("{failures} download(s) failed");
    }
    Ok(())
}
