mod api;
mod capture;
mod config;
mod ifaces;
mod shaping;
mod summary;

use anyhow::{Context, Result, bail};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use crate::api::AppState;
use crate::config::{Capability, Config};
use crate::shaping::TcRunner;

/// Web control panel for TC (Linux Traffic Control)
#[derive(Parser, Debug)]
#[command(name = "tcweb")]
#[command(version)]
#[command(about = "Shape and inspect interface traffic over HTTP", long_about = None)]
struct Args {
    /// Listen address override (e.g. "2023", ":2023" or "0.0.0.0:2023")
    #[arg(long, value_name = "ADDR")]
    listen: Option<String>,

    /// Env file to load (default: ./.env when present)
    #[arg(long, value_name = "FILE")]
    env_file: Option<PathBuf>,

    /// Skip the root privilege check (tcpdump and tcset need root)
    #[arg(long)]
    skip_root_check: bool,
}

fn init_logging() {
    let mut builder = pretty_env_logger::formatted_builder();
    match std::env::var("RUST_LOG") {
        Ok(filters) => {
            builder.parse_filters(&filters);
        }
        Err(_) => {
            builder.filter_level(log::LevelFilter::Info);
        }
    }
    builder.init();
}

#[cfg(unix)]
fn check_root() -> Result<()> {
    let uid = unsafe { libc::geteuid() };
    if uid != 0 {
        bail!("should run as root, uid={uid} (pass --skip-root-check to override)");
    }
    log::info!("run with root permissions, uid={uid}");
    Ok(())
}

#[cfg(not(unix))]
fn check_root() -> Result<()> {
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging();
    log::info!("WebUI for TC(Linux Traffic Control) https://lartc.org/howto/index.html");

    // tcpdump and tc need root.
    if !args.skip_root_check {
        check_root()?;
    }

    if let Some(path) = &args.env_file {
        dotenv::from_path(path).with_context(|| format!("load env file {}", path.display()))?;
    } else if std::path::Path::new(".env").exists() {
        dotenv::dotenv().context("load .env")?;
    }

    let mut config = Config::from_env()?;
    if let Some(listen) = &args.listen {
        config.listen = config::listen_addr(listen);
    }

    let capability = Capability::detect();
    log::info!(
        "config: listen={}, NODE_ENV={}, ui={}, iface_ipv4={}, iface_ipv6={}, api_port={}, \
         proxies={}, shaping={}, capture={}",
        config.listen,
        config.node_env,
        config.ui_endpoint,
        config.iface_ipv4,
        config.iface_ipv6,
        config.api_port,
        config.proxies.len(),
        capability.shaping,
        capability.capture,
    );
    for mount in &config.proxies {
        log::info!("proxy {} to {}", mount.mount, mount.backend);
    }

    let listen = config.listen.clone();
    let state = AppState {
        config: Arc::new(config),
        runner: Arc::new(TcRunner::new(capability)),
        capability,
        client: reqwest::Client::new(),
    };

    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("listen at {listen}"))?;
    log::info!("listen at {listen}");
    axum::serve(listener, api::router(state))
        .await
        .context("serve")?;
    Ok(())
}
