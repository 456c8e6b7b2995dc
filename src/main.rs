// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;
mod shell;

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use gridvm_comms::CommsBus;
use gridvm_net::{NetConfig, NetHandler};
use gridvm_runtime::{generate_runtime_id, Command, Runtime};

use cli::Cli;
use shell::Shell;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let runtime_id = generate_runtime_id();
    tracing::info!("starting runtime {runtime_id}");

    let (comms, outbound_rx) = CommsBus::new(runtime_id);
    let config = NetConfig {
        interface: cli.interface,
        group: cli.group,
    };
    let (net, net_handle) = NetHandler::bind(config, comms.clone(), outbound_rx)
        .await
        .context("cannot bind the network sockets")?;
    let net_task = tokio::spawn(net.run());

    let (mut runtime, runtime_handle) = Runtime::new(comms.clone());
    for program in &cli.programs {
        runtime
            .load_program(program)
            .with_context(|| format!("cannot load {}", program.display()))?;
    }
    let scheduler_task = tokio::task::spawn_blocking(move || runtime.run());

    let shell = Shell::new(runtime_handle.clone(), comms.peers(), net_handle.clone());
    let mut shell_task = tokio::task::spawn_blocking(move || shell.run());

    tokio::select! {
        result = &mut shell_task => {
            result.context("shell worker panicked")??;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted; shutting down");
            net_handle.prepare_shutdown();
            let handle = runtime_handle.clone();
            tokio::task::spawn_blocking(move || handle.request(Command::Shutdown))
                .await
                .ok();
            net_handle.shutdown();
            shell_task.abort();
        }
    }

    // Give the net handler its grace period to drain SHUTDOWN_ACKs, then
    // collect the scheduler.
    if tokio::time::timeout(Duration::from_secs(10), net_task)
        .await
        .is_err()
    {
        tracing::warn!("net handler did not stop in time");
    }
    let _ = tokio::time::timeout(Duration::from_secs(2), scheduler_task).await;

    tracing::info!("bye");
    Ok(())
}

/// Diagnostics go to stderr through `tracing`; program PRN output goes to
/// stdout untouched. `GRIDVM_LOG` takes priority over `-v`.
fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter =
        EnvFilter::try_from_env("GRIDVM_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}
