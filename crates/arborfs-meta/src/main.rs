#![warn(missing_docs)]

//! ArborFS metadata cluster daemon

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use arborfs_meta::{LocalCluster, MetaConfig};
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Runs an in-process metadata cluster.
#[derive(Parser, Debug)]
#[command(name = "arbor-meta", version, about)]
struct Args {
    /// Config file (.toml or .json)
    #[arg(short, long, env = "ARBOR_META_CONFIG")]
    config: Option<PathBuf>,

    /// Extra ticks to run after startup settles
    #[arg(long, default_value_t = 0)]
    ticks: u64,

    /// Print status as pretty JSON instead of one line
    #[arg(long)]
    status_json: bool,

    /// Keep ticking until interrupted
    #[arg(long)]
    serve: bool,

    /// Milliseconds per tick when serving
    #[arg(long, default_value_t = 1000)]
    tick_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => MetaConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => MetaConfig::default(),
    };

    let json_layer = config.log_json.then(|| fmt::layer().json());
    let text_layer = (!config.log_json).then(fmt::layer);
    tracing_subscriber::registry()
        .with(json_layer)
        .with(text_layer)
        .with(EnvFilter::from_default_env())
        .init();

    tracing::info!(
        max_active = config.max_active_ranks,
        standbys = config.standby_count,
        "ArborFS metadata cluster starting..."
    );

    let pins = config.pins.clone();
    let mut cluster = LocalCluster::new(config)?;
    for pin in &pins {
        cluster.mkdir_p(&pin.path)?;
        cluster.set_pin(&pin.path, pin.kind, &pin.value)?;
    }
    cluster.settle()?;
    for _ in 0..args.ticks {
        cluster.tick()?;
        while cluster.step()? {}
    }

    if args.serve {
        let mut interval = tokio::time::interval(Duration::from_millis(args.tick_ms.max(1)));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    cluster.tick()?;
                    while cluster.step()? {}
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("interrupted, shutting down");
                    break;
                }
            }
        }
    }

    cluster.check_single_authority()?;
    let status = cluster.status();
    let rendered = if args.status_json {
        serde_json::to_string_pretty(&status)?
    } else {
        serde_json::to_string(&status)?
    };
    println!("{}", rendered);
    Ok(())
}
