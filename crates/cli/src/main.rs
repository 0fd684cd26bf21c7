use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tracing::info;

use spill_addin::{Addin, AddinConfig};
use spill_core::{content_hash, origin_key, RangeRef};
use spill_host::{HostValue, MemHost, SheetHost};

#[derive(Parser, Debug)]
#[command(name = "spillctl", version, about = "Spill add-in driver")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Simulate recalculation passes against the in-memory host
    Run {
        /// Comma-separated items; omit to exercise the default list
        #[arg(long = "items")]
        items: Option<String>,
        /// Anchor sheet id
        #[arg(long = "sheet", default_value_t = 1)]
        sheet: u32,
        /// Anchor row (0-based)
        #[arg(long = "row", default_value_t = 0)]
        row: u32,
        /// Anchor column (0-based)
        #[arg(long = "col", default_value_t = 0)]
        col: u32,
        /// Recalculation passes to simulate
        #[arg(long = "passes", default_value_t = 2)]
        passes: usize,
        /// Keep the document unsafe to mutate (jobs drop at the gate)
        #[arg(long = "unsafe-doc", action = ArgAction::SetTrue)]
        unsafe_doc: bool,
    },
    /// Print the content hash and origin key for a request
    Hash {
        /// Comma-separated items
        items: String,
        /// Anchor sheet id
        #[arg(long = "sheet", default_value_t = 1)]
        sheet: u32,
        /// Anchor row (0-based)
        #[arg(long = "row", default_value_t = 0)]
        row: u32,
        /// Anchor column (0-based)
        #[arg(long = "col", default_value_t = 0)]
        col: u32,
    },
}

fn init_tracing() {
    let env = std::env::var("SPILL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("SPILL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid SPILL_METRICS_ADDR; expected host:port");
        }
    }
}

fn split_items(s: &str) -> Vec<String> {
    s.split(',')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

/// Wait for the drain loop to consume the queue, then give the in-flight
/// batch a moment to finish its host calls.
async fn settle(addin: &Addin) {
    for _ in 0..400 {
        if addin.pending_jobs() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { items, sheet, row, col, passes, unsafe_doc } => {
            let host = Arc::new(MemHost::new());
            host.set_safe(!unsafe_doc);
            let addin = Addin::start(host.clone() as Arc<dyn SheetHost>, AddinConfig::from_env())?;

            let arg = match items.as_deref() {
                Some(s) => {
                    let values: Vec<HostValue> =
                        split_items(s).into_iter().map(HostValue::Text).collect();
                    HostValue::Array { rows: values.len(), cols: 1, values }
                }
                None => HostValue::Missing,
            };

            for pass in 0..passes {
                host.set_caller(RangeRef::single(sheet, row, col));
                addin.on_request(&arg);
                info!(pass, pending = addin.pending_jobs(), "recalculation pass");
            }
            settle(&addin).await;
            addin.shutdown().await;

            let log = host.set_log();
            match cli.output {
                Output::Human => {
                    for (target, formula) in &log {
                        println!("sheet{} r{}c{}  {}", target.sheet, target.row, target.col, formula);
                    }
                    println!("{} cell(s) written", log.len());
                }
                Output::Json => {
                    let cells: Vec<serde_json::Value> = log
                        .iter()
                        .map(|(t, f)| {
                            serde_json::json!({
                                "sheet": t.sheet, "row": t.row, "col": t.col, "formula": f,
                            })
                        })
                        .collect();
                    println!("{}", serde_json::json!({ "cells": cells }));
                }
            }
        }
        Commands::Hash { items, sheet, row, col } => {
            let list = split_items(&items);
            let hash = content_hash(&list);
            let key = origin_key(sheet, row, col);
            match cli.output {
                Output::Human => {
                    println!("items:        {:?}", list);
                    println!("content hash: {:#018x}", hash);
                    println!("origin key:   {:#018x}", key);
                }
                Output::Json => {
                    println!(
                        "{}",
                        serde_json::json!({
                            "items": list,
                            "content_hash": format!("{:#018x}", hash),
                            "origin_key": format!("{:#018x}", key),
                        })
                    );
                }
            }
        }
    }

    Ok(())
}
