//! The time service core: election/sync state machine, socket lifecycle
//! and the worker thread event loop.
//!
//! A single worker thread owns the UDP socket and blocks on the union of
//! socket input, a cross-thread wakeup signal and the state machine
//! timeout.  All state machine fields live behind one lock which the
//! worker holds except while blocked; application threads take the same
//! lock briefly through the API methods in [`api`].

pub mod api;
pub mod handlers;


use std::fmt;
use std::fs;
use std::io::{self, ErrorKind};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{error, info, warn};
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;

use crate::clock::{CommonClock, LocalClock};
use crate::packets::{TimePacket, MAX_PACKET_LEN};
use crate::recovery::ClockRecoveryLoop;
use crate::service::ListenerRegistry;
use crate::util::{Deadline, LogRing};
use crate::{Result, TimeServiceError};

const WAKER_TOKEN: Token = Token(0);
const SOCKET_TOKEN: Token = Token(1);

/// Default master election endpoint: limited broadcast on port 8886.
pub const DEFAULT_ELECTION_PORT: u16 = 8886;

pub(crate) const DEFAULT_SYNC_GROUP_ID: u64 = 1;
pub(crate) const DEFAULT_MASTER_PRIORITY: u8 = 1;
pub(crate) const DEFAULT_MASTER_ANNOUNCE_INTERVAL_MS: u32 = 10_000;
pub(crate) const DEFAULT_SYNC_REQUEST_INTERVAL_MS: u32 = 1_000;
pub(crate) const DEFAULT_PANIC_THRESHOLD_US: u32 = 50_000;

// Retry schedule for rebuilding a socket after a setup failure.
const SETUP_RETRY_TIMEOUT_MS: u32 = 30_000;

// A client panics when this much common time passes without any usable
// sync data.
const NO_GOOD_DATA_PANIC_THRESHOLD_US: i64 = 600_000_000;

// Responses with an RTT above panic_threshold * this multiplier are
// discarded outright.
const RTT_DISCARD_PANIC_THRESH_MULTIPLIER: i64 = 5;

// Initial state: WhoIsMaster attempts before declaring ourselves master.
const INITIAL_NUM_WHO_IS_MASTER_RETRIES: u32 = 6;
const INITIAL_WHO_IS_MASTER_TIMEOUT_MS: u32 = 500;

// Client state: unanswered sync requests before the master is presumed
// dead.
const CLIENT_NUM_SYNC_REQUEST_RETRIES: u32 = 10;

// Ronin state: WhoIsMaster attempts before winning the election.
const RONIN_NUM_WHO_IS_MASTER_RETRIES: u32 = 20;
const RONIN_WHO_IS_MASTER_TIMEOUT_MS: u32 = 500;

// WaitForElection: how long to wait for the winner's announcement.
const WAIT_FOR_ELECTION_TIMEOUT_MS: u32 = 12_500;

const RTT_LOG_SIZE: usize = 30;

/// The role a node currently plays in the sync group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Just started; no timeline yet.
    Initial,
    /// Following a master.
    Client,
    /// Publishing a timeline.
    Master,
    /// Lost the master; calling an election.
    Ronin,
    /// Deferred to a better-arbitrated peer's election.
    WaitForElection,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Initial => "INITIAL",
            Role::Client => "CLIENT",
            Role::Master => "MASTER",
            Role::Ronin => "RONIN",
            Role::WaitForElection => "WAIT_FOR_ELECTION",
        };
        f.write_str(name)
    }
}

/// Startup configuration for [`CommonTimeServer`].
///
/// Every field can also be changed at runtime through the config facet;
/// the same validation limits apply in both places.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Master election endpoint.  Must be an IPv4 broadcast or multicast
    /// address with a nonzero port.
    pub election_endpoint: SocketAddrV4,
    /// Network interface to bind; `None` leaves the service unbound.
    pub bind_interface: Option<String>,
    /// Synchronization group; nonzero groups ignore each other's traffic.
    pub sync_group_id: u64,
    /// Election priority, 0-127.
    pub master_priority: u8,
    pub master_announce_interval_ms: u32,
    pub client_sync_interval_ms: u32,
    /// Discipline panic bound in microseconds of common time.
    pub panic_threshold_us: u32,
    /// Stop all network traffic while no client needs common time.
    pub auto_disable: bool,
    /// Fixed device ID.  When `None` the ID is derived from the bound
    /// interface's MAC address.
    pub device_id: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            election_endpoint: SocketAddrV4::new(Ipv4Addr::BROADCAST, DEFAULT_ELECTION_PORT),
            bind_interface: None,
            sync_group_id: DEFAULT_SYNC_GROUP_ID,
            master_priority: DEFAULT_MASTER_PRIORITY,
            master_announce_interval_ms: DEFAULT_MASTER_ANNOUNCE_INTERVAL_MS,
            client_sync_interval_ms: DEFAULT_SYNC_REQUEST_INTERVAL_MS,
            panic_threshold_us: DEFAULT_PANIC_THRESHOLD_US,
            auto_disable: true,
            device_id: None,
        }
    }
}

/// Paired TX/RX local timestamps of recent sync packets, for the status
/// dump.
pub(crate) struct PacketRttLog {
    tx_times: [i64; RTT_LOG_SIZE],
    rx_times: [Option<i64>; RTT_LOG_SIZE],
    wr: usize,
    full: bool,
}

impl PacketRttLog {
    fn new() -> Self {
        Self {
            tx_times: [0; RTT_LOG_SIZE],
            rx_times: [None; RTT_LOG_SIZE],
            wr: 0,
            full: false,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.wr = 0;
        self.full = false;
    }

    pub(crate) fn log_tx(&mut self, tx_time: i64) {
        self.tx_times[self.wr] = tx_time;
        self.rx_times[self.wr] = None;
        self.wr = (self.wr + 1) % RTT_LOG_SIZE;
        if self.wr == 0 {
            self.full = true;
        }
    }

    pub(crate) fn log_rx(&mut self, tx_time: i64, rx_time: i64) {
        if !self.full && self.wr == 0 {
            return;
        }

        let mut i = if self.full { self.wr } else { 0 };
        loop {
            if self.tx_times[i] == tx_time {
                self.rx_times[i] = Some(rx_time);
                break;
            }
            i = (i + 1) % RTT_LOG_SIZE;
            if i == self.wr {
                break;
            }
        }
    }

    pub(crate) fn dump(
        &self,
        out: &mut dyn io::Write,
        common_clock: &CommonClock,
    ) -> io::Result<()> {
        let avail = if self.full { RTT_LOG_SIZE } else { self.wr };
        if avail == 0 {
            return Ok(());
        }

        writeln!(out, "\nPacket Log ({avail} entries)")?;
        let mut ndx = 0;
        let mut i = if self.full { self.wr } else { 0 };
        loop {
            match self.rx_times[i] {
                Some(rx) => {
                    let delta = rx - self.tx_times[i];
                    let usec = common_clock
                        .local_duration_to_common_duration(delta)
                        .unwrap_or(0);
                    writeln!(
                        out,
                        "pkt[{ndx:2}] : localTX {:12} localRX {rx:12} ({:.3} msec RTT)",
                        self.tx_times[i],
                        usec as f64 / 1000.0
                    )?;
                }
                None => {
                    writeln!(out, "pkt[{ndx:2}] : localTX {:12} localRX never", self.tx_times[i])?;
                }
            }
            i = (i + 1) % RTT_LOG_SIZE;
            ndx += 1;
            if i == self.wr {
                break;
            }
        }
        Ok(())
    }
}

/// Everything guarded by the state machine lock.
pub(crate) struct ServerState {
    pub(crate) role: Role,
    pub(crate) config: ServerConfig,
    pub(crate) bind_iface_dirty: bool,

    pub(crate) socket: Option<UdpSocket>,
    pub(crate) device_id: Option<u64>,
    pub(crate) timeline: Option<u64>,
    pub(crate) clock_synced: bool,
    pub(crate) force_low_priority: bool,
    pub(crate) common_clock_has_clients: bool,

    pub(crate) master_ep: Option<SocketAddr>,
    pub(crate) client_master_device_id: u64,
    pub(crate) client_master_priority: u8,
    pub(crate) sync_request_pending: bool,
    pub(crate) sync_request_timeouts: u32,
    pub(crate) syncs_sent_to_cur_master: u32,
    pub(crate) sync_resps_rxed_from_cur_master: u32,
    pub(crate) expired_sync_resps_rxed_from_cur_master: u32,
    pub(crate) first_sync_tx: Option<i64>,
    pub(crate) last_good_sync_rx: Option<i64>,
    pub(crate) rtt_log: PacketRttLog,

    pub(crate) initial_who_is_master_timeouts: u32,
    pub(crate) ronin_who_is_master_timeouts: u32,

    pub(crate) cur_timeout: Deadline,
    pub(crate) last_packet_rx_local: i64,
    pub(crate) exit_pending: bool,

    pub(crate) state_change_log: LogRing,
    pub(crate) election_log: LogRing,
    pub(crate) bad_packet_log: LogRing,

    pub(crate) local_clock: Arc<dyn LocalClock>,
    pub(crate) common_clock: Arc<CommonClock>,
    pub(crate) recovery: Arc<ClockRecoveryLoop>,
    pub(crate) listeners: Arc<ListenerRegistry>,
}

/// The time service core.  Construct with [`CommonTimeServer::new`],
/// start the worker with [`CommonTimeServer::start`], and hand clones of
/// the `Arc` to the public interface facets.
pub struct CommonTimeServer {
    pub(crate) state: Arc<Mutex<ServerState>>,
    waker: Waker,
    poll: Mutex<Option<Poll>>,
    worker: Mutex<Option<JoinHandle<()>>>,

    local_clock: Arc<dyn LocalClock>,
    common_clock: Arc<CommonClock>,
    recovery: Arc<ClockRecoveryLoop>,
    listeners: Arc<ListenerRegistry>,
}

impl CommonTimeServer {
    /// Build the service core.  Fails on invalid configuration or when
    /// the common clock cannot be derived from the local clock frequency.
    pub fn new(local_clock: Arc<dyn LocalClock>, config: ServerConfig) -> Result<Arc<Self>> {
        api::validate_priority(config.master_priority)?;
        api::validate_election_endpoint(&config.election_endpoint)?;
        api::validate_announce_interval(config.master_announce_interval_ms)?;
        api::validate_sync_interval(config.client_sync_interval_ms)?;
        api::validate_panic_threshold(config.panic_threshold_us)?;

        let common_clock = Arc::new(CommonClock::new());
        common_clock.init(local_clock.frequency())?;

        let recovery = Arc::new(ClockRecoveryLoop::new(
            local_clock.clone(),
            common_clock.clone(),
        ));
        recovery.set_panic_threshold(config.panic_threshold_us as i64);

        let listeners = Arc::new(ListenerRegistry::new());

        let poll = Poll::new().map_err(TimeServiceError::Io)?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN).map_err(TimeServiceError::Io)?;

        let frequency = local_clock.frequency();
        let state = ServerState {
            role: Role::Initial,
            bind_iface_dirty: false,
            socket: None,
            device_id: config.device_id,
            timeline: None,
            clock_synced: false,
            force_low_priority: false,
            common_clock_has_clients: false,
            master_ep: None,
            client_master_device_id: 0,
            client_master_priority: 0,
            sync_request_pending: false,
            sync_request_timeouts: 0,
            syncs_sent_to_cur_master: 0,
            sync_resps_rxed_from_cur_master: 0,
            expired_sync_resps_rxed_from_cur_master: 0,
            first_sync_tx: None,
            last_good_sync_rx: None,
            rtt_log: PacketRttLog::new(),
            initial_who_is_master_timeouts: 0,
            ronin_who_is_master_timeouts: 0,
            cur_timeout: Deadline::new(frequency),
            last_packet_rx_local: 0,
            exit_pending: false,
            state_change_log: LogRing::new("Recent State Change Events", 30),
            election_log: LogRing::new("Recent Master Election Traffic", 30),
            bad_packet_log: LogRing::new("Recent Bad Packet RX Info", 8),
            local_clock: local_clock.clone(),
            common_clock: common_clock.clone(),
            recovery: recovery.clone(),
            listeners: listeners.clone(),
            config,
        };

        let state = Arc::new(Mutex::new(state));
        state.lock().become_initial("startup");

        Ok(Arc::new(Self {
            state,
            waker,
            poll: Mutex::new(Some(poll)),
            worker: Mutex::new(None),
            local_clock,
            common_clock,
            recovery,
            listeners,
        }))
    }

    /// Start the worker thread.
    pub fn start(&self) -> Result<()> {
        let poll = self
            .poll
            .lock()
            .take()
            .ok_or(TimeServiceError::Lifecycle("server already started"))?;

        let state = self.state.clone();
        let handle = thread::Builder::new()
            .name("common-time-worker".to_string())
            .spawn(move || run_event_loop(state, poll))
            .map_err(TimeServiceError::Io)?;
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    /// Request a graceful shutdown and join the worker thread.
    pub fn shutdown(&self) {
        {
            let mut st = self.state.lock();
            st.exit_pending = true;
        }
        let _ = self.waker.wake();

        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }

    /// Block until the worker thread exits.
    pub fn wait(&self) {
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }

    pub(crate) fn wake_worker(&self) {
        let _ = self.waker.wake();
    }

    pub fn local_clock(&self) -> &Arc<dyn LocalClock> {
        &self.local_clock
    }

    pub fn common_clock(&self) -> &Arc<CommonClock> {
        &self.common_clock
    }

    pub fn clock_recovery(&self) -> &Arc<ClockRecoveryLoop> {
        &self.recovery
    }

    pub(crate) fn listener_registry(&self) -> &Arc<ListenerRegistry> {
        &self.listeners
    }
}

impl Drop for CommonTimeServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_event_loop(state: Arc<Mutex<ServerState>>, mut poll: Poll) {
    let mut events = Events::with_capacity(16);

    loop {
        let timeout = {
            let st = state.lock();
            if st.exit_pending {
                break;
            }

            let now = st.local_clock.now();
            let t1 = st.cur_timeout.ms_until(now);
            let t2 = st.recovery.apply_rate_limited_slew();
            match (t1, t2) {
                (Some(a), Some(b)) => Some(Duration::from_millis(a.min(b))),
                (Some(a), None) => Some(Duration::from_millis(a)),
                (None, Some(b)) => Some(Duration::from_millis(b)),
                (None, None) => None,
            }
        };

        match poll.poll(&mut events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("event loop poll failed: {e}");
                break;
            }
        }

        let mut st = state.lock();
        if st.exit_pending {
            break;
        }

        let wakeup_local = st.local_clock.now();
        let mut socket_ready = false;
        for event in events.iter() {
            if event.token() == SOCKET_TOKEN {
                socket_ready = true;
            }
        }

        // Is our bind interface dirty, or do we have an active socket but
        // should be auto-disabled?  Either way, release the socket.
        let mut dropped_socket = false;
        if st.bind_iface_dirty || (st.socket.is_some() && st.should_auto_disable()) {
            st.cleanup_socket(poll.registry());
            st.bind_iface_dirty = false;
            dropped_socket = true;
        }

        if st.socket.is_none() && st.config.bind_interface.is_some() && !st.should_auto_disable() {
            if st.setup_socket(poll.registry()) {
                // We are joining a new network (either coming from no
                // network or from a different one).  Defer to any master
                // already established there until we have proven
                // ourselves: force low election priority until we reach a
                // settled state.
                st.set_force_low_priority(true);
                match st.role {
                    Role::Initial => st.become_initial("bound interface"),
                    Role::Master => st.become_ronin("leaving networkless mode"),
                    _ => st.become_ronin("bound interface"),
                }
            } else {
                let now = st.local_clock.now();
                st.cur_timeout.set(now, SETUP_RETRY_TIMEOUT_MS);
            }
            continue;
        } else if dropped_socket {
            // No socket, and nothing says we should rebuild one: we are
            // parked in network-less mode until config or clients change.
            let line = format!(
                "Entering networkless mode: interface is {}, auto-disable engaged = {}",
                if st.config.bind_interface.is_some() {
                    "valid"
                } else {
                    "invalid"
                },
                st.should_auto_disable()
            );
            st.state_change_log.push_logged(log::Level::Info, line);
            if st.role != Role::Initial && st.role != Role::Master {
                if st.timeline.is_none() {
                    st.become_initial("network-less mode");
                } else {
                    st.become_master("network-less mode");
                }
            }
            continue;
        }

        // Drain the socket first; timeouts are evaluated only after all
        // pending input has been read.
        if socket_ready && st.socket.is_some() {
            st.last_packet_rx_local = wakeup_local;
            let mut buf = [0u8; 256];
            loop {
                let received = match st.socket.as_ref() {
                    Some(socket) => socket.recv_from(&mut buf),
                    None => break,
                };
                match received {
                    Ok((len, src)) => st.handle_packet(&buf[..len], src),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => {
                        st.bad_packet_log
                            .push_logged(log::Level::Error, format!("recv_from failed: {e}"));
                        break;
                    }
                }
            }
        }

        let now = st.local_clock.now();
        if st.cur_timeout.ms_until(now) == Some(0) {
            st.cur_timeout.clear();
            st.handle_timeout();
        }
    }

    let mut st = state.lock();
    st.cleanup_socket(poll.registry());
    info!("time service worker exiting");
}

impl ServerState {
    pub(crate) fn effective_priority(&self) -> u8 {
        (self.config.master_priority & 0x7F) | if self.force_low_priority { 0x00 } else { 0x80 }
    }

    pub(crate) fn should_auto_disable(&self) -> bool {
        self.config.auto_disable && !self.common_clock_has_clients
    }

    pub(crate) fn set_force_low_priority(&mut self, value: bool) {
        self.force_low_priority = value;
        if self.role == Role::Master {
            self.client_master_priority = self.effective_priority();
        }
    }

    pub(crate) fn reset_sync_stats(&mut self) {
        self.sync_request_pending = false;
        self.sync_request_timeouts = 0;
        self.syncs_sent_to_cur_master = 0;
        self.sync_resps_rxed_from_cur_master = 0;
        self.expired_sync_resps_rxed_from_cur_master = 0;
        self.first_sync_tx = None;
        self.last_good_sync_rx = None;
        self.rtt_log.reset();
    }

    pub(crate) fn notify_clock_sync(&mut self) {
        if !self.clock_synced {
            self.clock_synced = true;
            self.listeners.notify_timeline_changed(self.timeline);
        }
    }

    pub(crate) fn notify_clock_sync_loss(&mut self) {
        if self.clock_synced {
            self.clock_synced = false;
            self.listeners.notify_timeline_changed(None);
        }
    }

    /// Pick a fresh nonzero timeline ID.
    pub(crate) fn assign_timeline_id(&mut self) {
        loop {
            let id: u64 = rand::random();
            if id != 0 {
                self.timeline = Some(id);
                break;
            }
        }
    }

    pub(crate) fn cleanup_socket(&mut self, registry: &Registry) {
        if let Some(mut socket) = self.socket.take() {
            let _ = registry.deregister(&mut socket);
        }
    }

    /// Build, configure and register the election socket.  On failure the
    /// socket is left torn down and `false` is returned so the caller can
    /// schedule a retry.
    pub(crate) fn setup_socket(&mut self, registry: &Registry) -> bool {
        self.cleanup_socket(registry);

        let iface = match self.config.bind_interface.clone() {
            Some(iface) => iface,
            None => return false,
        };

        let line = format!(
            "Building socket :: bind = {iface} master election = {}",
            self.config.election_endpoint
        );
        self.state_change_log.push_logged(log::Level::Info, line);

        match self.try_setup_socket(&iface, registry) {
            Ok((socket, device_id)) => {
                self.socket = Some(socket);
                self.device_id = Some(device_id);
                true
            }
            Err(e) => {
                self.state_change_log
                    .push_logged(log::Level::Error, format!("socket setup failed: {e}"));
                false
            }
        }
    }

    fn try_setup_socket(&self, iface: &str, registry: &Registry) -> Result<(UdpSocket, u64)> {
        use socket2::{Domain, Protocol, SockAddr, Socket, Type};

        let election = self.config.election_endpoint;

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(TimeServiceError::SocketSetup)?;

        // Restrict traffic to the configured interface, then bind to the
        // wildcard address so one socket sees both unicast replies and
        // the election broadcast/multicast.
        #[cfg(target_os = "linux")]
        socket
            .bind_device(Some(iface.as_bytes()))
            .map_err(TimeServiceError::SocketSetup)?;

        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, election.port());
        socket
            .bind(&SockAddr::from(SocketAddr::V4(bind_addr)))
            .map_err(TimeServiceError::SocketSetup)?;

        let election_ip = *election.ip();
        if election_ip.is_multicast() {
            socket
                .join_multicast_v4(&election_ip, &Ipv4Addr::UNSPECIFIED)
                .map_err(TimeServiceError::SocketSetup)?;
            socket
                .set_multicast_loop_v4(false)
                .map_err(TimeServiceError::SocketSetup)?;
            socket
                .set_multicast_ttl_v4(1)
                .map_err(TimeServiceError::SocketSetup)?;
        } else if election_ip == Ipv4Addr::BROADCAST {
            socket
                .set_broadcast(true)
                .map_err(TimeServiceError::SocketSetup)?;
        } else {
            // The config facet rejects anything else before it gets here.
            return Err(TimeServiceError::SocketSetup(io::Error::new(
                ErrorKind::InvalidInput,
                "election endpoint is neither broadcast nor multicast",
            )));
        }

        // Sync traffic must never leave the subnet.
        socket.set_ttl(1).map_err(TimeServiceError::SocketSetup)?;

        socket
            .set_nonblocking(true)
            .map_err(TimeServiceError::SocketSetup)?;

        let device_id = match self.config.device_id {
            Some(id) => id,
            None => derive_device_id(iface)?,
        };

        let std_socket: std::net::UdpSocket = socket.into();
        let mut mio_socket = UdpSocket::from_std(std_socket);
        registry
            .register(&mut mio_socket, SOCKET_TOKEN, Interest::READABLE)
            .map_err(TimeServiceError::SocketSetup)?;

        Ok((mio_socket, device_id))
    }

    /// Encode and transmit a packet.  Transmit failures are logged and
    /// swallowed; the state machine keeps running on transient I/O
    /// errors.
    pub(crate) fn send_packet(&mut self, packet: &TimePacket, dest: SocketAddr) {
        let socket = match self.socket.as_ref() {
            Some(socket) => socket,
            None => return,
        };

        let mut buf = Vec::with_capacity(MAX_PACKET_LEN);
        packet.encode(&mut buf);
        match socket.send_to(&buf, dest) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                warn!("send_to {dest} would block; packet dropped");
            }
            Err(e) => {
                error!("send_to {dest} failed: {e}");
            }
        }
    }
}

/// Derive the 56-bit device ID from an interface's MAC address.
fn derive_device_id(iface: &str) -> Result<u64> {
    let path = format!("/sys/class/net/{iface}/address");
    let text = fs::read_to_string(&path).map_err(TimeServiceError::SocketSetup)?;

    let mut id = 0u64;
    let mut octets = 0;
    for part in text.trim().split(':') {
        let byte = u8::from_str_radix(part, 16).map_err(|_| {
            TimeServiceError::SocketSetup(io::Error::new(
                ErrorKind::InvalidData,
                format!("unparsable MAC address for {iface}"),
            ))
        })?;
        id = (id << 8) | byte as u64;
        octets += 1;
    }

    if octets != 6 {
        return Err(TimeServiceError::SocketSetup(io::Error::new(
            ErrorKind::InvalidData,
            format!("expected a 6-octet MAC address for {iface}"),
        )));
    }

    Ok(id)
}
