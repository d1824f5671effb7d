// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

mod audio;
mod command;
mod config;
mod errors;
mod host;
mod ipc;
mod lifecycle;
mod poster;
mod progress;
mod registry;
mod selection;
mod server;
mod storage;
mod swarm;
mod torrent_file;

use std::backtrace::Backtrace;
use std::env;
use std::fs::{self, File};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use clap::Parser;
use fs2::FileExt;
use rand::Rng;
use tokio::sync::mpsc;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*};

use crate::command::HostResponse;
use crate::config::{load_settings, save_settings};
use crate::host::{Host, HostContext};
use crate::poster::DefaultPosterSource;
use crate::swarm::offline::OfflineClient;
use crate::swarm::rqbit::RqbitClient;
use crate::swarm::SwarmClient;

const DEFAULT_LOG_FILTER: LevelFilter = LevelFilter::INFO;
const COMMAND_QUEUE: usize = 64;
const EVENT_QUEUE: usize = 256;

/// Torrent engine host driven over newline-delimited JSON on stdin/stdout.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings file to use instead of the one in the config directory.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the effective settings as TOML and exit.
    #[arg(long)]
    print_config: bool,

    /// Never contact peers; serve only data already on disk.
    #[arg(long)]
    offline: bool,
}

fn base_data_dir() -> PathBuf {
    config::get_app_paths()
        .map(|(_, data_dir)| data_dir)
        .unwrap_or_else(|| env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let mut settings = load_settings(cli.config.as_deref());
    settings.offline |= cli.offline;

    if cli.print_config {
        print!("{}", toml::to_string_pretty(&settings)?);
        return Ok(());
    }

    // stdout carries the protocol, so logs only ever go to a file.
    let log_dir = base_data_dir().join("logs");
    fs::create_dir_all(&log_dir)?;
    let general_log = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .max_log_files(31)
        .filename_prefix("host")
        .filename_suffix("log")
        .build(&log_dir)?;
    let (non_blocking_general, log_guard) = tracing_appender::non_blocking(general_log);
    let level = LevelFilter::from_str(&settings.log_level).unwrap_or(DEFAULT_LOG_FILTER);
    let general_layer = fmt::layer()
        .with_writer(non_blocking_general)
        .with_ansi(false)
        .with_filter(Targets::new().with_default(level));
    let _ = tracing_subscriber::registry().with(general_layer).try_init();

    tracing::info!("STARTING SWARMHOST");

    let lock_path = base_data_dir().join("swarmhost.lock");
    let lock_file = File::create(&lock_path)?;
    if lock_file.try_lock_exclusive().is_err() {
        tracing::error!("Another host holds {:?}, exiting.", lock_path);
        eprintln!("swarmhost is already running.");
        std::process::exit(1);
    }

    if settings.client_id.is_empty() {
        settings.client_id = generate_client_id_string();
        if let Err(e) = save_settings(&settings, cli.config.as_deref()) {
            tracing::error!("Failed to save settings after generating client ID: {}", e);
        }
    }
    tracing::info!(client_id = %settings.client_id, "Settings loaded");

    let (response_tx, response_rx) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);

    install_panic_reporter(response_tx.clone());

    let client: Arc<dyn SwarmClient> = if settings.offline {
        tracing::info!("Offline mode, peers will not be contacted");
        Arc::new(OfflineClient::new(
            event_tx,
            settings.torrents_dir.clone(),
            settings.offline_verify_concurrency,
        ))
    } else {
        let download_dir = settings
            .default_download_folder
            .clone()
            .unwrap_or_else(|| base_data_dir().join("downloads"));
        Arc::new(RqbitClient::new(event_tx, download_dir, &settings.client_id).await?)
    };
    client.set_global_trackers(settings.global_trackers.clone());

    let _reader = ipc::spawn_reader(tokio::io::stdin(), command_tx);
    let writer = ipc::spawn_writer(tokio::io::stdout(), response_rx);

    let host = Host::new(HostContext {
        client,
        settings,
        poster: Arc::new(DefaultPosterSource::default()),
        responses: response_tx,
    });
    host.run(command_rx, event_rx).await;

    // Dropping the hook drops its sender, which lets the writer drain and finish.
    drop(std::panic::take_hook());
    let _ = writer.await;
    tracing::info!("Host exited");

    // A pending stdin read would keep the runtime from shutting down.
    drop(log_guard);
    std::process::exit(0)
}

/// Reports every panic to the controller as an `uncaught-error` before the
/// previous hook runs.
fn install_panic_reporter(responses: mpsc::UnboundedSender<HostResponse>) {
    let original_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        tracing::error!("Panic: {}", panic_info);
        let _ = responses.send(HostResponse::UncaughtError {
            message: panic_info.to_string(),
            stack: Backtrace::force_capture().to_string(),
        });
        original_hook(panic_info);
    }));
}

fn generate_client_id_string() -> String {
    const CLIENT_PREFIX: &str = "-SH0100-";
    const RANDOM_LEN: usize = 12;

    let mut rng = rand::rng();
    let random_chars: String = (0..RANDOM_LEN)
        .map(|_| {
            const CHARSET: &[u8] =
                b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
            CHARSET[rng.random_range(0..CHARSET.len())] as char
        })
        .collect();

    format!("{}{}", CLIENT_PREFIX, random_chars)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_shape() {
        let id = generate_client_id_string();
        assert_eq!(id.len(), 20);
        assert!(id.starts_with("-SH0100-"));
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::parse_from(["swarmhost", "--config", "/tmp/s.toml", "--print-config"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/s.toml")));
        assert!(cli.print_config);
        assert!(!cli.offline);
        assert!(Cli::parse_from(["swarmhost", "--offline"]).offline);
    }

    #[test]
    fn test_panic_reporter_sends_uncaught_error() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        install_panic_reporter(tx);
        let result = std::panic::catch_unwind(|| panic!("worker lost its torrent"));
        drop(std::panic::take_hook());
        assert!(result.is_err());

        let reported = std::iter::from_fn(|| rx.try_recv().ok()).find_map(|response| match response {
            HostResponse::UncaughtError { message, stack } if message.contains("worker lost its torrent") => {
                Some(stack)
            }
            _ => None,
        });
        let stack = reported.expect("no uncaught-error for the panic");
        assert!(!stack.is_empty());
    }
}
