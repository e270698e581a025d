// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use esplogbridge::bridge::Bridge;
use esplogbridge::config::Config;

const EXIT_RUNTIME: u8 = 1;
const EXIT_USAGE: u8 = 2;

/// Relays ESPHome UDP logs to a Loki push endpoint.
#[derive(Debug, Parser)]
#[command(name = "esplogbridge", version, about, disable_version_flag = true)]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "./esplogbridge.yaml")]
    config: PathBuf,

    /// Print version and exit.
    #[arg(short = 'v', long, action = clap::ArgAction::Version)]
    version: Option<bool>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = if e.use_stderr() { EXIT_USAGE } else { 0 };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    let config = match Config::load(&args.config) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("esplogbridge: {e}");
            return ExitCode::from(EXIT_USAGE);
        }
    };

    if let Err(e) = init_logging(&config.log_level) {
        eprintln!("esplogbridge: {e}");
        return ExitCode::from(EXIT_USAGE);
    }
    debug!("Logging subsystem enabled");

    let cancel_token = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel_token.clone()));

    info!(
        "Starting esplogbridge {} with config {}",
        env!("CARGO_PKG_VERSION"),
        args.config.display()
    );

    match Bridge::new(config).run(cancel_token).await {
        Ok(()) => {
            info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Bridge stopped: {e}");
            eprintln!("esplogbridge: {e}");
            ExitCode::from(EXIT_RUNTIME)
        }
    }
}

fn init_logging(log_level: &str) -> Result<(), String> {
    let env_filter = format!("h2=off,hyper=off,rustls=off,{log_level}");
    let filter = EnvFilter::try_new(env_filter)
        .map_err(|e| format!("config: invalid log_level {log_level:?}: {e}"))?;

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| format!("setting default subscriber failed: {e}"))
}

/// Cancels `cancel_token` on the first SIGINT or SIGTERM.
async fn shutdown_on_signal(cancel_token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel_token.cancel();
                }
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {e}");
            return;
        }
        info!("Received ctrl-c, shutting down");
    }

    cancel_token.cancel();
}
