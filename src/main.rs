// Module declarations
mod admin;
mod cli;
mod config;
mod continuity;
mod error;
mod fingerprint;
mod history;
mod observation;
mod rank;
mod registry;
mod scanner;
mod server;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::DateTime;
use clap::Parser;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use crate::admin::{AdminList, AdminPredicate};
use crate::cli::{Cli, Command};
use crate::config::{DEFAULT_LOG_FILTER, ServiceConfig, load_config, save_config};
use crate::fingerprint::{Fingerprint, LEVEL_THRESHOLDS};
use crate::history::{
    HighActiveRecord, HistoryQuery, HistoryStore, SqliteHistoryStore, open_history_store,
};
use crate::registry::SlotRegistry;
use crate::scanner::spawn_scanner;
use crate::server::{ServerState, run_server};

fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    // A second init (tests, embedding) is harmless; keep the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn serve(config: ServiceConfig, no_scanner: bool) -> Result<(), Box<dyn std::error::Error>> {
    let registry = Arc::new(SlotRegistry::new(config.limits));
    let history = open_history_store(&config.history_db)?;
    let admins = AdminList::new(config.admin_ids.iter().copied());
    tracing::info!(
        global_slots = config.limits.global_slots,
        owner_slots = config.limits.owner_slots,
        admins = admins.len(),
        history_db = %config.history_db.display(),
        "slot registry ready"
    );

    let scanner = if config.scanner.enabled && !no_scanner {
        let admins: Arc<dyn AdminPredicate> = Arc::new(admins);
        Some(spawn_scanner(
            config.scanner.clone(),
            Arc::clone(&registry),
            admins,
            Arc::clone(&history),
        )?)
    } else {
        tracing::info!("high-activity scanner disabled");
        None
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        tracing::info!("shutdown requested");
        flag.store(true, Ordering::SeqCst);
    })?;

    let result = run_server(
        &config.bind,
        config.port,
        ServerState {
            registry,
            history,
        },
        &shutdown,
    );

    if let Some((handle, join)) = scanner {
        tracing::info!(scanner_running = handle.is_running(), "stopping scanner");
        handle.stop();
        if join.join().is_err() {
            tracing::warn!("scanner thread panicked");
        }
    }
    result?;
    Ok(())
}

fn format_ts(ts: i64) -> String {
    DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}

fn print_history(records: &[HighActiveRecord]) {
    if records.is_empty() {
        println!("No records.");
        return;
    }
    println!(
        "{:<19}  {:>8}  {:<20}  {:>6}  {:>6}",
        "created_at", "user_id", "username", "slots", "window"
    );
    for record in records {
        println!(
            "{:<19}  {:>8}  {:<20}  {:>6}  {:>6}",
            format_ts(record.created_at),
            record.owner_id,
            record.owner_name,
            record.active_slots,
            record.window_secs
        );
    }
}

#[derive(Serialize)]
struct FingerprintLevel {
    threshold: usize,
    hash: String,
    covered: bool,
}

#[derive(Serialize)]
struct FingerprintReport {
    length: usize,
    max_level: usize,
    levels: Vec<FingerprintLevel>,
}

fn fingerprint_report(data: &[u8]) -> FingerprintReport {
    let fp = Fingerprint::compute(data);
    let levels = LEVEL_THRESHOLDS
        .iter()
        .enumerate()
        .map(|(idx, &threshold)| FingerprintLevel {
            threshold,
            hash: fp.level_hex(idx).unwrap_or_default(),
            covered: data.len() >= threshold,
        })
        .collect();
    FingerprintReport {
        length: data.len(),
        max_level: fp.max_level,
        levels,
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            bind,
            port,
            no_scanner,
        } => {
            let mut service = load_config(&config)?;
            service.apply_env()?;
            if let Some(bind) = bind {
                service.bind = bind;
            }
            if let Some(port) = port {
                service.port = port;
            }
            service.validate()?;
            init_tracing(&service.log_filter);
            serve(service, no_scanner)
        }

        Command::History {
            db,
            start,
            end,
            owner,
            limit,
            json,
        } => {
            init_tracing(DEFAULT_LOG_FILTER);
            if !db.exists() {
                eprintln!("History database not found: {}", db.display());
                std::process::exit(2);
            }
            let store = SqliteHistoryStore::open_or_create(&db)?;
            let records = store.query(&HistoryQuery {
                start_time: start,
                end_time: end,
                owner_id: owner,
                limit,
            })?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                print_history(&records);
                println!("{} of {} stored records", records.len(), store.record_count()?);
            }
            Ok(())
        }

        Command::Fingerprint { file, text, json } => {
            let data = match (file, text) {
                (Some(path), _) => std::fs::read(&path)?,
                (None, Some(text)) => text.into_bytes(),
                (None, None) => {
                    let mut buf = Vec::new();
                    std::io::Read::read_to_end(&mut std::io::stdin(), &mut buf)?;
                    buf
                }
            };
            let report = fingerprint_report(&data);
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("length: {} bytes, max_level: {}", report.length, report.max_level);
                for (idx, level) in report.levels.iter().enumerate() {
                    let mark = if level.covered { "" } else { " (partial)" };
                    println!("  L{idx} {:>6}: {}{mark}", level.threshold, level.hash);
                }
            }
            Ok(())
        }

        Command::InitConfig { path } => {
            if Path::new(&path).exists() {
                eprintln!("Refusing to overwrite existing file: {}", path.display());
                std::process::exit(2);
            }
            save_config(&path, &ServiceConfig::default())?;
            println!("Wrote {}", path.display());
            Ok(())
        }
    }
}
