//! Common time synchronization daemon.
//!
//! Binds the time service to a network interface, publishes the clock and
//! config facets for in-process use, and runs until killed.  With no
//! interface the service stays parked; `--networkless-master` makes it
//! publish a timeline anyway.

use std::net::SocketAddrV4;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::info;

use common_time::clock::SystemLocalClock;
use common_time::diag::{DiagServer, DEFAULT_DIAG_PORT};
use common_time::server::{CommonTimeServer, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "common_timed", about = "Common time synchronization daemon")]
struct Args {
    /// Network interface to bind (e.g. eth0).
    #[arg(long)]
    iface: Option<String>,

    /// Master election priority, 0-127.
    #[arg(long, default_value_t = 1)]
    priority: u8,

    /// Synchronization group ID.
    #[arg(long, default_value_t = 1)]
    group: u64,

    /// Master election endpoint (IPv4 broadcast or multicast).
    #[arg(long, default_value = "255.255.255.255:8886")]
    election_endpoint: SocketAddrV4,

    /// Master announcement interval in milliseconds.
    #[arg(long, default_value_t = 10_000)]
    announce_interval_ms: u32,

    /// Client sync request interval in milliseconds.
    #[arg(long, default_value_t = 1_000)]
    sync_interval_ms: u32,

    /// Discipline panic threshold in microseconds.
    #[arg(long, default_value_t = 50_000)]
    panic_threshold_us: u32,

    /// Keep synchronizing even with no registered time clients.
    #[arg(long)]
    no_auto_disable: bool,

    /// Publish a timeline immediately, without a network.
    #[arg(long)]
    networkless_master: bool,

    /// Enable the TCP diagnostic interface.
    #[arg(long)]
    diag: bool,

    /// Diagnostic interface listen port.
    #[arg(long, default_value_t = DEFAULT_DIAG_PORT)]
    diag_port: u16,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = ServerConfig {
        election_endpoint: args.election_endpoint,
        bind_interface: args.iface.clone(),
        sync_group_id: args.group,
        master_priority: args.priority,
        master_announce_interval_ms: args.announce_interval_ms,
        client_sync_interval_ms: args.sync_interval_ms,
        panic_threshold_us: args.panic_threshold_us,
        auto_disable: !args.no_auto_disable,
        device_id: None,
    };

    let local_clock = Arc::new(SystemLocalClock::new());
    let server =
        CommonTimeServer::new(local_clock, config).context("failed to build time service")?;

    // Keep the diag server handle alive for the life of the daemon.
    let _diag = if args.diag {
        let (diag, sink) =
            DiagServer::spawn(args.diag_port).context("failed to start diagnostic interface")?;
        server.clock_recovery().attach_diag(sink);
        Some(diag)
    } else {
        None
    };

    server.start().context("failed to start worker thread")?;

    if args.networkless_master {
        if args.iface.is_some() {
            anyhow::bail!("--networkless-master conflicts with --iface");
        }
        server
            .force_networkless_master_mode()
            .context("failed to force networkless master mode")?;
    }

    info!(
        "common time service running (iface: {}, priority {}, group {:#x})",
        args.iface.as_deref().unwrap_or("<unbound>"),
        args.priority,
        args.group
    );

    server.wait();
    Ok(())
}
