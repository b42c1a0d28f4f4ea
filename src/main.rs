use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

use upflow::pfcp::ControlProcess;
use upflow::{cli, config, Upf};

#[derive(Parser)]
#[clap(name = "upflow", about = "GTP-U user-plane core")]
struct Args {
    /// Path to config file
    #[clap(short, long, env = "UPFLOW_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("upflow=info,uf_dataplane=info")),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => config::load(path).await?,
        None => config::Config::default(),
    };

    let upf = Arc::new(Upf::new(config.clone()));
    let channels = upf
        .take_control_channels()
        .context("control channels already claimed")?;

    let control = ControlProcess::bind(
        config.pfcp_bind,
        config.pfcp_bind6,
        upf.session_manager(),
        upf.sessions.clone(),
        channels.urr_rx,
        channels.timeout_rx,
    )
    .await
    .context("Failed to bind the PFCP service port")?;

    info!(bind = %config.pfcp_bind, "PFCP control channel listening");
    tokio::spawn(control.run());

    // Admin commands on stdin until EOF or interrupt. Worker engines are
    // created by the embedding packet driver via `Upf::new_worker`.
    let ctx = upf.cli_context();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line? {
                Some(line) => match cli::execute(&ctx, &line) {
                    Ok(out) => {
                        if !out.is_empty() {
                            println!("{}", out);
                        }
                    }
                    Err(e) => println!("error: {}", e),
                },
                None => break,
            },
        }
    }

    info!("shutting down");
    Ok(())
}
