use clap::{Arg, ArgAction, ArgMatches, Command};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use orange_rangefetch::core::config::DownloadConfig;
use orange_rangefetch::core::engine::Engine;
use orange_rangefetch::core::events::EngineEvent;
use orange_rangefetch::core::model::{ItemStatus, JobStatus, LinkInput};
use orange_rangefetch::plugins::registry::{DownloadCliConfig, DriverContext, PluginRegistry};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

fn build_cli(registry: &PluginRegistry) -> Command {
    let download = Command::new("download")
        .about("Download one or more links")
        .arg(
            Arg::new("links")
                .help("Links to download")
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
        )
        .arg(
            Arg::new("concurrency")
                .long("concurrency")
                .help("Max concurrent connections per item")
                .default_value("6")
                .value_parser(clap::value_parser!(usize))
                .num_args(1),
        )
        .arg(
            Arg::new("max_fragments")
                .long("max-fragments")
                .help("Max simultaneously active segments (defaults to --concurrency)")
                .value_parser(clap::value_parser!(usize))
                .num_args(1),
        )
        .arg(
            Arg::new("connection_interval_ms")
                .long("connection-interval-ms")
                .help("Pause before opening each additional connection")
                .default_value("500")
                .value_parser(clap::value_parser!(u64))
                .num_args(1),
        )
        .arg(
            Arg::new("buffer_kb")
                .long("buffer-kb")
                .help("Read buffer size in KiB")
                .default_value("64")
                .value_parser(clap::value_parser!(usize))
                .num_args(1),
        );

    let download = registry.augment_download_command(download);

    Command::new("orange-rangefetch")
        .about("Parallel HTTP range downloader")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(download)
}

fn download_config(m: &ArgMatches) -> DownloadCliConfig {
    let mut download = DownloadConfig::default();
    if let Some(&n) = m.get_one::<usize>("concurrency") {
        download.max_concurrent_threads = n;
    }
    download.max_fragments = m.get_one::<usize>("max_fragments").copied();
    if let Some(&ms) = m.get_one::<u64>("connection_interval_ms") {
        download.additional_connection_interval = Duration::from_millis(ms);
    }
    if let Some(&kb) = m.get_one::<usize>("buffer_kb") {
        download.buffer_size = kb.saturating_mul(1024);
    }

    DownloadCliConfig { headers: HashMap::new(), driver_ctx: DriverContext::default(), download }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let registry = PluginRegistry::with_defaults()?;
    let app = build_cli(&registry);
    let matches = app.get_matches();

    let Some(("download", m)) = matches.subcommand() else {
        return Ok(());
    };

    let out_dir: PathBuf = m
        .get_one::<String>("out_dir")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("./downloads"));

    let mut cfg = download_config(m);
    registry.apply_download_matches(m, &mut cfg)?;

    let engine = Engine::new(registry, out_dir, cfg.download.clone(), cfg.driver_ctx.clone()).await?;

    let inputs: Vec<LinkInput> = m
        .get_many::<String>("links")
        .into_iter()
        .flatten()
        .map(|raw| LinkInput { raw: raw.clone(), headers: cfg.headers.clone() })
        .collect();

    let rx = engine.subscribe();
    let job_id = engine.add_and_start(inputs).await?;
    println!("Job started: {}", job_id);

    let ui_task = tokio::spawn(run_ui(rx, job_id));

    {
        let engine = engine.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("interrupted, cancelling");
                engine.cancel();
            }
        });
    }

    let status = engine.wait_job(job_id).await;
    let _ = ui_task.await;
    println!("Job finished: {}", job_id);

    match status {
        Some(JobStatus::Completed) => Ok(()),
        other => anyhow::bail!("job {} ended as {:?}", job_id, other),
    }
}

#[derive(Clone)]
struct ItemView {
    display_name: String,
    target_path: String,
    status: String,
    downloaded: u64,
    total: Option<u64>,
    errors: Vec<String>,
}

async fn run_ui(mut rx: tokio::sync::broadcast::Receiver<EngineEvent>, ui_job_id: Uuid) {
    let mp = MultiProgress::new();
    let sty_pb = ProgressStyle::with_template("{spinner:.green} {prefix} {wide_msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_chars("|/-\\ ");
    let sty_bar = ProgressStyle::with_template(
        "{prefix} {bar:40.cyan/blue} {bytes}/{total_bytes} ({bytes_per_sec}, eta {eta}) {wide_msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar());

    let mut bars: HashMap<Uuid, ProgressBar> = HashMap::new();
    let mut items: HashMap<Uuid, ItemView> = HashMap::new();

    loop {
        let evt = match rx.recv().await {
            Ok(e) => e,
            // progress is sampled, dropping a few events is harmless
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        };

        match evt {
            EngineEvent::JobStatusChanged { job_id, status } => {
                if job_id != ui_job_id {
                    continue;
                }
                let _ = mp.println(format!("[JOB] {} -> {:?}", job_id, status));
                if matches!(status, JobStatus::Completed | JobStatus::Failed) {
                    print_summary(&mp, &items);
                    break;
                }
            }
            EngineEvent::ItemAdded { item_id, display_name, target_path, uri } => {
                let pb = mp.add(ProgressBar::new_spinner());
                pb.set_style(sty_pb.clone());
                pb.set_prefix(format!("[{display_name}]"));
                pb.enable_steady_tick(Duration::from_millis(120));
                pb.set_message(format!("added -> {} ({})", target_path.display(), uri));
                bars.insert(item_id, pb);
                items.insert(
                    item_id,
                    ItemView {
                        display_name,
                        target_path: target_path.display().to_string(),
                        status: "added".to_string(),
                        downloaded: 0,
                        total: None,
                        errors: vec![],
                    },
                );
            }
            EngineEvent::ItemStatusChanged { item_id, status } => {
                if let Some(v) = items.get_mut(&item_id) {
                    v.status = format!("{:?}", status);
                }
                if let Some(pb) = bars.get(&item_id) {
                    match status {
                        ItemStatus::Done => pb.finish_with_message("done"),
                        ItemStatus::Failed => pb.abandon_with_message("failed"),
                        other => pb.set_message(format!("status={:?}", other)),
                    }
                }
            }
            EngineEvent::Progress { item_id, downloaded, total, speed_bps, eta, .. } => {
                if let Some(v) = items.get_mut(&item_id) {
                    v.downloaded = downloaded;
                    v.total = total;
                }
                let Some(pb) = bars.get(&item_id) else { continue };
                if pb.is_finished() {
                    continue;
                }

                if let Some(t) = total {
                    if pb.length() != Some(t) {
                        pb.set_style(sty_bar.clone());
                        pb.set_length(t);
                    }
                    pb.set_position(downloaded.min(t));
                }

                let eta_s = eta
                    .map(|d| format!("{:.0}s", d.as_secs_f64()))
                    .unwrap_or_else(|| "-".to_string());
                pb.set_message(format!(
                    "{} / {} | {}/s | eta {}",
                    fmt_bytes(downloaded),
                    total.map(fmt_bytes).unwrap_or_else(|| "?".to_string()),
                    fmt_bytes(speed_bps),
                    eta_s
                ));
            }
            EngineEvent::Error { scope, message } => {
                let _ = mp.println(format!("[ERR] {}: {}", scope, message));
                for v in items.values_mut() {
                    if scope.contains(&v.display_name) {
                        v.errors.push(message.clone());
                    }
                }
            }
            EngineEvent::Info { scope, message } => {
                let _ = mp.println(format!("[INFO] {}: {}", scope, message));
            }
        }
    }
}

fn print_summary(mp: &MultiProgress, items: &HashMap<Uuid, ItemView>) {
    let _ = mp.println("");
    let _ = mp.println("Summary:");
    let mut views: Vec<_> = items.values().collect();
    views.sort_by(|a, b| a.display_name.cmp(&b.display_name));
    for v in views {
        let total_s = v.total.map(fmt_bytes).unwrap_or_else(|| "?".to_string());
        let _ = mp.println(format!(
            "- {} status={} {} / {} path={}",
            v.display_name,
            v.status,
            fmt_bytes(v.downloaded),
            total_s,
            v.target_path,
        ));
        for e in &v.errors {
            let _ = mp.println(format!("  error: {}", e));
        }
    }
}

fn fmt_bytes(n: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let f = n as f64;
    if f >= GB {
        format!("{:.2}GiB", f / GB)
    } else if f >= MB {
        format!("{:.2}MiB", f / MB)
    } else if f >= KB {
        format!("{:.2}KiB", f / KB)
    } else {
        format!("{}B", n)
    }
}
