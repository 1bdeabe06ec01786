use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use burrow::config;
use burrow::plugins::{auth::AuthPlugin, ipallow::IpAllowPlugin, stats::StatsPlugin, Pipeline};
use burrow::tunnel;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        error!("{err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let mut pipeline = Pipeline::new();
    pipeline.register_plugin(Box::new(StatsPlugin::new()));
    pipeline.register_plugin(Box::new(AuthPlugin::new()));
    pipeline.register_plugin(Box::new(IpAllowPlugin::new()));

    let command = Command::new("burrow")
        .about("Expose local ports on public burrow.dev subdomains")
        .arg(
            Arg::new("ports")
                .value_name("PORT")
                .num_args(1..)
                .required(true)
                .help("Local ports to expose"),
        );
    let matches = match pipeline.register_flags(command).try_get_matches() {
        Ok(matches) => matches,
        Err(err) => {
            let exit_code = if matches!(
                err.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            ) {
                0
            } else {
                1
            };
            let _ = err.print();
            std::process::exit(exit_code);
        }
    };

    let mut ports: Vec<u16> = Vec::new();
    for raw in matches
        .get_many::<String>("ports")
        .expect("ports are required")
    {
        let port = raw
            .parse::<u16>()
            .with_context(|| format!("invalid port: {raw}"))?;
        ports.push(port);
    }

    pipeline.configure(&matches);
    pipeline.activate();

    let worker_url = config::worker_url();
    let client_id = config::client_id().context("failed to load client id")?;

    info!("registering ports...");
    let mapping = tunnel::register(&client_id, &ports, &worker_url, pipeline.worker_config())
        .await
        .context("failed to register ports")?;

    println!("\n--- Tunnel mappings ---");
    for (port, subdomain) in &mapping {
        println!(
            "http://localhost:{port}  ->  {}",
            public_url(&worker_url, subdomain)
        );
    }
    println!("-----------------------");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let pipeline = Arc::new(pipeline);
    let mut tunnels = Vec::new();
    for (port, subdomain) in mapping {
        tunnels.push(tokio::spawn(tunnel::start_tunnel(
            subdomain,
            port,
            worker_url.clone(),
            pipeline.clone(),
            shutdown_rx.clone(),
        )));
    }
    for task in tunnels {
        let _ = task.await;
    }

    info!("all tunnels closed, goodbye");
    Ok(())
}

/// Public URL for one subdomain, derived from the edge base URL
/// (`https://tunnel.<zone>` becomes `https://<subdomain>.<zone>`).
fn public_url(worker_url: &str, subdomain: &str) -> String {
    let base = worker_url.trim_end_matches('/');
    if let Some((scheme, host)) = base.split_once("://") {
        if let Some(zone) = host.strip_prefix("tunnel.") {
            return format!("{scheme}://{subdomain}.{zone}");
        }
        return format!("{scheme}://{subdomain}.{host}");
    }
    format!("https://{subdomain}.{base}")
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal as unix_signal, SignalKind};
        let mut sigterm = match unix_signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(_) => {
                let _ = signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}
