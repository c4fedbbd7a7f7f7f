//! Common time synchronization service.
//!
//! This crate implements a subnet-local clock synchronization daemon.  The
//! devices on a network segment elect a master, and every other device
//! disciplines its own clock against the master's oscillator so that all of
//! them share a monotonic "common time": a timeline derived from each
//! device's local monotonic clock through a linear transform.
//!
//! # Architecture Overview
//!
//! ```text
//! +--------------------------+
//! |     Public Interface     |
//! |  (clock + config facets) |
//! +--------------------------+
//! |      State Machine       |
//! | (election / sync roles)  |
//! +-------------+------------+
//! | Wire Codec  |  Recovery  |
//! | (5 packets) | (PI loop)  |
//! +-------------+------------+
//! |  Common Clock transform  |
//! +--------------------------+
//! |   Local monotonic clock  |
//! +--------------------------+
//! ```
//!
//! A single worker thread multiplexes the election/sync UDP socket, a
//! cross-thread wakeup signal and the state machine timeout.  Incoming sync
//! responses are fed to a PI controller which slews either the local
//! hardware clock or the software common-clock transform.  Applications
//! query the shared timeline through [`service::ClockService`] and tune the
//! daemon through [`service::ConfigService`].
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use common_time::clock::SystemLocalClock;
//! use common_time::server::{CommonTimeServer, ServerConfig};
//! use common_time::service::ClockService;
//!
//! fn main() -> common_time::Result<()> {
//!     let clock = Arc::new(SystemLocalClock::new());
//!     let mut config = ServerConfig::default();
//!     config.bind_interface = Some("eth0".to_string());
//!
//!     let server = CommonTimeServer::new(clock, config)?;
//!     server.start()?;
//!
//!     let clock_svc = ClockService::new(server.clone());
//!     let (valid, timeline) = clock_svc.is_common_time_valid();
//!     println!("synced: {valid}, timeline: {timeline:?}");
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod diag;
pub mod packets;
pub mod recovery;
pub mod server;
pub mod service;
pub mod util;

pub mod prelude;

/// Error types for time service operations
#[derive(thiserror::Error, Debug)]
pub enum TimeServiceError {
    /// Common time has no valid basis yet (not synced to any timeline).
    #[error("common time is not valid yet")]
    NotSynced,

    /// A clock transform would overflow 64-bit time.
    #[error("arithmetic overflow in clock transform")]
    Overflow,

    /// A configuration value was rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An inbound packet failed validation.
    #[error("malformed packet: {0}")]
    BadPacket(&'static str),

    /// Building or binding the election socket failed.
    #[error("socket setup failed: {0}")]
    SocketSetup(#[source] std::io::Error),

    /// Transient I/O failure on an established socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The local clock has no hardware frequency trim.
    #[error("hardware slew is not supported by the local clock")]
    SlewNotSupported,

    /// Networkless master mode requires that no socket is bound.
    #[error("service is currently bound to a network interface")]
    NetworkBound,

    /// The local or common clock could not be initialized.
    #[error("clock initialization failed: {0}")]
    ClockInit(String),

    /// The worker thread is already running or has been shut down.
    #[error("invalid server lifecycle operation: {0}")]
    Lifecycle(&'static str),
}

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, TimeServiceError>;
