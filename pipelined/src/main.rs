//! main - runs the pipeline controller against an in-process switch

use anyhow::{Result, ensure};
use async_std::channel::Sender;
use async_std::prelude::*;
use clap::Parser;
use local_ip_address;
use openflow::SoftSwitch;
use pipelined::{Config, LogProxy, LogReporter, Pipelined, SystemResolver, load_config_file};
use signal_hook::consts::signal::*;
use signal_hook_async_std::Signals;
use slog::{Drain, Logger, info, o};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML config file.  Without one, the built-in defaults are used.
    #[arg(long)]
    config: Option<String>,

    /// Address of the bridge that captive portal traffic is rewritten to.  Defaults to
    /// the address in the config file, or else the eth0 address.
    #[arg(long)]
    bridge_ip: Option<Ipv4Addr>,

    /// Wipe all flows when the switch connects rather than keeping what survived.
    #[arg(long)]
    clean_restart: Option<bool>,

    /// Datapath id of the switch.
    #[arg(long, default_value_t = 1)]
    datapath_id: u64,
}

#[async_std::main]
async fn main() -> Result<()> {
    exit_on_panic();
    let logger = init_logging();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(filename) => load_config_file(filename, &logger)?,
        None => Config::default(),
    };
    if let Some(bridge_ip) = args.bridge_ip {
        config.bridge_ip_address = bridge_ip;
    } else if args.config.is_none() {
        if let Ok(IpAddr::V4(ip)) = local_ip_address::local_ip() {
            config.bridge_ip_address = ip;
        }
    }
    if let Some(clean_restart) = args.clean_restart {
        config.clean_restart = clean_restart;
    }
    check_bridge_ip(&config.bridge_ip_address)?;

    let (switch, switch_events) = SoftSwitch::new(args.datapath_id);
    let pipelined = Pipelined::start(
        config,
        switch.clone(),
        switch_events,
        Arc::new(LogReporter::new(&logger.new(o!("reporter" => "log")))),
        Arc::new(SystemResolver),
        Arc::new(LogProxy::new(&logger.new(o!("proxy" => "log")))),
        logger.clone(),
    )
    .await?;
    switch.connect().await?;
    info!(logger, "Started with epoch {}", pipelined.epoch());

    wait_for_signal().await?;
    pipelined.graceful_shutdown().await;

    Ok(())
}

fn init_logging() -> Logger {
    // Use info level logging by default
    if std::env::var("RUST_LOG").is_err() {
        unsafe { std::env::set_var("RUST_LOG", "info") }
    }
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let drain = slog_envlogger::new(drain);
    slog::Logger::root(drain, o!())
}

fn exit_on_panic() {
    let orig_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        orig_hook(panic_info);
        std::process::exit(1);
    }));
}

fn check_bridge_ip(ip: &Ipv4Addr) -> Result<()> {
    ensure!(
        !ip.is_unspecified(),
        "Unspecific IP address 0.0.0.0 not allowed for the bridge - portal traffic is rewritten to it"
    );
    Ok(())
}

async fn wait_for_signal() -> Result<i32> {
    let signals = Signals::new([SIGHUP, SIGTERM, SIGINT, SIGQUIT])?;
    let handle = signals.handle();
    let (sig_sender, sig_receiver) = async_std::channel::unbounded();
    let signals_task = async_std::task::spawn(handle_signals(signals, sig_sender));
    let signal = sig_receiver.recv().await;
    handle.close();
    signals_task.await;
    Ok(signal?)
}

async fn handle_signals(signals: Signals, sig_sender: Sender<i32>) {
    let mut signals = signals.fuse();
    while let Some(signal) = signals.next().await {
        match signal {
            SIGHUP => {
                // Reload configuration
            }
            SIGTERM | SIGINT | SIGQUIT => {
                let _ = sig_sender.send(signal).await;
            }
            _ => unreachable!(),
        }
    }
}
