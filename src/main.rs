//! vivado-remote - drive an interactive Vivado Tcl shell over TCP
//!
//! One terminal runs `vivado-remote serve`, which starts Vivado behind a
//! pseudo terminal and relays its shell over a single-client TCP port. The
//! operator keeps typing into Vivado while build sub-commands connect,
//! run a fixed command sequence and report what failed.
//!
//! # Quick Start
//!
//! ```text
//! vivado-remote serve --exec_path ~/Xilinx/Vivado/2023.2/bin/vivado
//! vivado-remote synth -p xc7a35tcpg236-1 -v top.sv -t top -o synth.dcp
//! vivado-remote place -p xc7a35tcpg236-1 -i synth.dcp -o place.dcp
//! vivado-remote route -p xc7a35tcpg236-1 -i place.dcp -o route.dcp
//! vivado-remote bitstream -p xc7a35tcpg236-1 -i route.dcp -o top.bit --check
//! vivado-remote load -p xc7a35tcpg236-1 -i top.bit
//! ```
//!
//! Logs go to `~/.vivado-remote/vivado-remote.log`.

mod cleanup;
mod cli;
mod client;
mod config;
mod core;
mod flows;
#[cfg(unix)]
mod server;

use std::env;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::cli::{Cli, Commands, ServeArgs};
use crate::client::{Client, Console};
use crate::config::Config;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };
    init_logging(cli.log_level.as_deref().unwrap_or(&config.log_level));

    match cli.command {
        Commands::Serve(args) => serve(args, config),
        command => run_client(&command, &config),
    }
}

/// Log to a file so the relayed terminal stays clean
fn init_logging(level: &str) {
    let log_path = Config::app_dir()
        .map(|dir| dir.join("vivado-remote.log"))
        .unwrap_or_else(|| PathBuf::from("vivado-remote.log"));

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .ok();

    if let Some(file) = log_file {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}

#[cfg(unix)]
fn serve(args: ServeArgs, mut config: Config) -> anyhow::Result<()> {
    use crate::core::process::{ProcessSupervisor, SupervisorConfig};
    use crate::server::SessionServer;

    if let Some(exec_path) = args.exec_path {
        config.server.exec_path = exec_path;
    }
    if args.no_raw {
        config.server.raw_mode = false;
    }
    let host = args.host.unwrap_or(config.host);
    let port = args.port.unwrap_or(config.port);
    let settings = config.server;

    info!("vivado-remote {} serving {} on {}:{}", env!("CARGO_PKG_VERSION"), settings.program(), host, port);

    let supervisor = ProcessSupervisor::new(
        SupervisorConfig::new(settings.program(), settings.args.clone())
            .with_relay(settings.relay_mode())
            .with_poll_interval(settings.poll_interval()),
    )?;
    let mut server = SessionServer::new(supervisor, host, port)
        .with_poll_interval(settings.poll_interval())
        .with_announcements(settings.echo_output);

    let served = server.serve_forever();
    let stopped = server.stop();

    let cwd = env::current_dir().context("Failed to read working directory")?;
    let removed = cleanup::remove_byproducts(&cwd, &settings.temp_files);
    info!("Session ended, removed {} byproduct file(s)", removed);

    for e in [&served, &stopped].into_iter().filter_map(|r| r.as_ref().err()) {
        if e.is_fatal() {
            error!("Session shutdown failed: {}", e);
            eprintln!("\r\nfatal: {}\r", e);
            process::abort();
        }
    }
    drop(server);

    served.context("Session server failed")?;
    stopped.context("Session shutdown failed")?;
    Ok(())
}

#[cfg(not(unix))]
fn serve(_args: ServeArgs, _config: Config) -> anyhow::Result<()> {
    anyhow::bail!("serve needs Unix pseudo terminals; run it on a Unix host")
}

fn run_client(command: &Commands, config: &Config) -> anyhow::Result<()> {
    let Some(common) = command.common() else {
        return Ok(());
    };

    let verbose = common.verbose || config.client.verbose;
    let host = common.host.as_deref().unwrap_or(&config.host);
    let port = common.port.unwrap_or(config.port);
    let command_timeout = common
        .timeout
        .map(Duration::from_secs)
        .or(config.client.command_timeout());

    let classifier = config.client.classifier()?;
    let console = Console::stdout(verbose);
    let mut client = Client::connect(host, port, config.client.connect_timeout(), classifier, console)?
        .with_command_timeout(command_timeout);

    let cwd = env::current_dir().context("Failed to read working directory")?;
    let result = client
        .change_directory(&cwd.to_string_lossy())
        .and_then(|_| flows::dispatch(&mut client, command));

    match result {
        Ok(()) => {
            info!("{} finished", command.name());
            if verbose {
                client.console().newline();
            }
            Ok(())
        }
        Err(e) => {
            error!("{} failed: {}", command.name(), e);
            if let Some(output) = command.output() {
                cleanup::remove_artifact(output);
            }
            client.console().failure_banner();
            process::exit(1);
        }
    }
}
