//! Clock and configuration API methods on [`CommonTimeServer`].
//!
//! These run on caller threads under the state machine lock.  Setters
//! that affect the socket or a pending timeout poke the worker through
//! the wakeup signal; the change takes effect on its next loop
//! iteration.

use std::io::{self, Write};
use std::net::{SocketAddr, SocketAddrV4};

use crate::server::{CommonTimeServer, Role};
use crate::{Result, TimeServiceError};

const MIN_MASTER_ANNOUNCE_INTERVAL_MS: u32 = 500;
const MAX_MASTER_ANNOUNCE_INTERVAL_MS: u32 = 6 * 3_600_000; // once per 6 hours
const MIN_CLIENT_SYNC_INTERVAL_MS: u32 = 250;
const MAX_CLIENT_SYNC_INTERVAL_MS: u32 = 3_600_000; // once per 60 minutes
const MIN_PANIC_THRESHOLD_US: u32 = 1_000;

pub(crate) fn validate_priority(priority: u8) -> Result<()> {
    if priority > 0x7F {
        return Err(TimeServiceError::InvalidConfig(format!(
            "election priority {priority} exceeds 127"
        )));
    }
    Ok(())
}

pub(crate) fn validate_election_endpoint(endpoint: &SocketAddrV4) -> Result<()> {
    if endpoint.port() == 0 {
        return Err(TimeServiceError::InvalidConfig(
            "election endpoint port must be nonzero".to_string(),
        ));
    }

    let ip = *endpoint.ip();
    if !ip.is_multicast() && !ip.is_broadcast() {
        return Err(TimeServiceError::InvalidConfig(format!(
            "election endpoint {ip} is neither broadcast nor multicast"
        )));
    }
    Ok(())
}

pub(crate) fn validate_announce_interval(interval_ms: u32) -> Result<()> {
    if !(MIN_MASTER_ANNOUNCE_INTERVAL_MS..=MAX_MASTER_ANNOUNCE_INTERVAL_MS).contains(&interval_ms) {
        return Err(TimeServiceError::InvalidConfig(format!(
            "master announce interval {interval_ms} ms outside \
             [{MIN_MASTER_ANNOUNCE_INTERVAL_MS}, {MAX_MASTER_ANNOUNCE_INTERVAL_MS}]"
        )));
    }
    Ok(())
}

pub(crate) fn validate_sync_interval(interval_ms: u32) -> Result<()> {
    if !(MIN_CLIENT_SYNC_INTERVAL_MS..=MAX_CLIENT_SYNC_INTERVAL_MS).contains(&interval_ms) {
        return Err(TimeServiceError::InvalidConfig(format!(
            "client sync interval {interval_ms} ms outside \
             [{MIN_CLIENT_SYNC_INTERVAL_MS}, {MAX_CLIENT_SYNC_INTERVAL_MS}]"
        )));
    }
    Ok(())
}

pub(crate) fn validate_panic_threshold(threshold_us: u32) -> Result<()> {
    if threshold_us < MIN_PANIC_THRESHOLD_US {
        return Err(TimeServiceError::InvalidConfig(format!(
            "panic threshold {threshold_us} usec below {MIN_PANIC_THRESHOLD_US}"
        )));
    }
    Ok(())
}

impl CommonTimeServer {
    //
    // Clock API
    //

    pub fn get_timeline_id(&self) -> Option<u64> {
        self.state.lock().timeline
    }

    pub fn get_state(&self) -> Role {
        self.state.lock().role
    }

    pub fn get_master_addr(&self) -> Option<SocketAddr> {
        self.state.lock().master_ep
    }

    /// Estimated sync error in microseconds: `Some(0)` when we define the
    /// timeline ourselves, the last filter delta when following a master,
    /// `None` when not synced.
    pub fn get_estimated_error(&self) -> Option<i32> {
        let st = self.state.lock();

        if st.role == Role::Master {
            return Some(0);
        }
        if !st.clock_synced {
            return None;
        }
        st.recovery.last_error_estimate()
    }

    pub fn is_common_time_valid(&self) -> (bool, Option<u64>) {
        let st = self.state.lock();
        (st.common_clock.is_valid(), st.timeline)
    }

    //
    // Config API
    //

    pub fn get_master_election_priority(&self) -> u8 {
        self.state.lock().config.master_priority
    }

    pub fn set_master_election_priority(&self, priority: u8) -> Result<()> {
        validate_priority(priority)?;
        self.state.lock().config.master_priority = priority;
        Ok(())
    }

    pub fn get_master_election_endpoint(&self) -> SocketAddrV4 {
        self.state.lock().config.election_endpoint
    }

    pub fn set_master_election_endpoint(&self, endpoint: SocketAddrV4) -> Result<()> {
        validate_election_endpoint(&endpoint)?;

        let mut st = self.state.lock();
        st.config.election_endpoint = endpoint;
        // Changing election endpoints requires a rebind.
        st.bind_iface_dirty = true;
        drop(st);
        self.wake_worker();
        Ok(())
    }

    pub fn get_master_election_group_id(&self) -> u64 {
        self.state.lock().config.sync_group_id
    }

    pub fn set_master_election_group_id(&self, group_id: u64) -> Result<()> {
        self.state.lock().config.sync_group_id = group_id;
        Ok(())
    }

    pub fn get_interface_binding(&self) -> Option<String> {
        self.state.lock().config.bind_interface.clone()
    }

    pub fn set_interface_binding(&self, iface: Option<String>) -> Result<()> {
        let mut st = self.state.lock();
        st.bind_iface_dirty = true;
        st.config.bind_interface = iface.filter(|name| !name.is_empty());
        drop(st);
        self.wake_worker();
        Ok(())
    }

    pub fn get_master_announce_interval(&self) -> u32 {
        self.state.lock().config.master_announce_interval_ms
    }

    pub fn set_master_announce_interval(&self, interval_ms: u32) -> Result<()> {
        validate_announce_interval(interval_ms)?;

        let mut st = self.state.lock();
        st.config.master_announce_interval_ms = interval_ms;
        if st.role == Role::Master {
            // Re-arm when the next announcement would otherwise be
            // further out than the new interval allows.
            let now = st.local_clock.now();
            let pending = st.cur_timeout.ms_until(now);
            if pending.is_none() || pending > Some(interval_ms as u64) {
                st.cur_timeout.set(now, interval_ms);
                drop(st);
                self.wake_worker();
            }
        }
        Ok(())
    }

    pub fn get_client_sync_interval(&self) -> u32 {
        self.state.lock().config.client_sync_interval_ms
    }

    pub fn set_client_sync_interval(&self, interval_ms: u32) -> Result<()> {
        validate_sync_interval(interval_ms)?;

        let mut st = self.state.lock();
        st.config.client_sync_interval_ms = interval_ms;
        if st.role == Role::Client {
            let now = st.local_clock.now();
            let pending = st.cur_timeout.ms_until(now);
            if pending.is_none() || pending > Some(interval_ms as u64) {
                st.cur_timeout.set(now, interval_ms);
                drop(st);
                self.wake_worker();
            }
        }
        Ok(())
    }

    pub fn get_panic_threshold(&self) -> u32 {
        self.state.lock().config.panic_threshold_us
    }

    pub fn set_panic_threshold(&self, threshold_us: u32) -> Result<()> {
        validate_panic_threshold(threshold_us)?;

        let mut st = self.state.lock();
        st.config.panic_threshold_us = threshold_us;
        st.recovery.set_panic_threshold(threshold_us as i64);
        Ok(())
    }

    pub fn get_auto_disable(&self) -> bool {
        self.state.lock().config.auto_disable
    }

    pub fn set_auto_disable(&self, auto_disable: bool) -> Result<()> {
        self.state.lock().config.auto_disable = auto_disable;
        self.wake_worker();
        Ok(())
    }

    /// Declare this node the master of a brand new timeline without any
    /// network.  Only valid while no socket is bound.
    pub fn force_networkless_master_mode(&self) -> Result<()> {
        let mut st = self.state.lock();

        if st.socket.is_some() {
            return Err(TimeServiceError::NetworkBound);
        }

        st.become_master("force networkless");
        Ok(())
    }

    /// Called by the clock facet when its registered-client count
    /// changes; flips auto-disable engagement in the worker.
    pub fn reevaluate_auto_disable_state(&self, common_clock_has_clients: bool) {
        let mut st = self.state.lock();
        let need_wakeup = st.config.auto_disable
            && st.master_ep.is_some()
            && common_clock_has_clients != st.common_clock_has_clients;

        st.common_clock_has_clients = common_clock_has_clients;

        if need_wakeup {
            log::info!(
                "waking service, auto-disable engaged and service now has{} clients",
                if common_clock_has_clients { "" } else { " no" }
            );
            drop(st);
            self.wake_worker();
        }
    }

    //
    // Status dumps
    //

    pub fn dump_clock_status(&self, out: &mut dyn Write, active_clients: usize) -> io::Result<()> {
        let st = self.state.lock();

        let local_time = st.local_clock.now();
        let common_time = st.common_clock.local_to_common(local_time).ok();

        writeln!(out, "Common Clock Service Status")?;
        writeln!(out, "Local time     : {local_time}")?;
        match common_time {
            Some(common) => writeln!(out, "Common time    : {common}")?,
            None => writeln!(out, "Common time    : not synced")?,
        }
        writeln!(out, "Timeline ID    : {:016x}", st.timeline.unwrap_or(0))?;
        writeln!(out, "State          : {}", st.role)?;
        match st.master_ep {
            Some(ep) => writeln!(out, "Master Addr    : {ep}")?,
            None => writeln!(out, "Master Addr    : <none>")?,
        }

        if common_time.is_some() {
            let est = if st.role == Role::Master {
                Some(0)
            } else {
                st.recovery.last_error_estimate()
            };
            match est {
                Some(usec) => writeln!(out, "Error Est.     : {:.3} msec", usec as f64 / 1000.0)?,
                None => writeln!(out, "Error Est.     : unknown")?,
            }
        } else {
            writeln!(out, "Error Est.     : unknown")?;
        }

        let pct = |num: u32, den: u32| {
            if den == 0 {
                0.0
            } else {
                100.0 * num as f64 / den as f64
            }
        };
        writeln!(out, "Syncs TXed     : {}", st.syncs_sent_to_cur_master)?;
        writeln!(
            out,
            "Syncs RXed     : {} ({:.2}%)",
            st.sync_resps_rxed_from_cur_master,
            pct(st.sync_resps_rxed_from_cur_master, st.syncs_sent_to_cur_master)
        )?;
        writeln!(
            out,
            "RXs Expired    : {} ({:.2}%)",
            st.expired_sync_resps_rxed_from_cur_master,
            pct(
                st.expired_sync_resps_rxed_from_cur_master,
                st.syncs_sent_to_cur_master
            )
        )?;

        match st.last_good_sync_rx {
            None => writeln!(out, "Last Good RX   : unknown")?,
            Some(rx) => {
                let usec = st
                    .common_clock
                    .local_duration_to_common_duration(local_time - rx)
                    .unwrap_or(0);
                writeln!(out, "Last Good RX   : {usec} uSec ago")?;
            }
        }
        writeln!(out, "Active Clients : {active_clients}")?;

        st.rtt_log.dump(out, &st.common_clock)?;
        st.state_change_log.dump(out)?;
        st.election_log.dump(out)?;
        st.bad_packet_log.dump(out)?;
        Ok(())
    }

    pub fn dump_config_status(&self, out: &mut dyn Write) -> io::Result<()> {
        let st = self.state.lock();

        writeln!(out, "Common Time Config Service Status")?;
        writeln!(
            out,
            "Bound Interface           : {}",
            st.config.bind_interface.as_deref().unwrap_or("<unbound>")
        )?;
        writeln!(
            out,
            "Master Election Endpoint  : {}",
            st.config.election_endpoint
        )?;
        writeln!(
            out,
            "Master Election Group ID  : {:016x}",
            st.config.sync_group_id
        )?;
        writeln!(
            out,
            "Master Announce Interval  : {} mSec",
            st.config.master_announce_interval_ms
        )?;
        writeln!(
            out,
            "Client Sync Interval      : {} mSec",
            st.config.client_sync_interval_ms
        )?;
        writeln!(
            out,
            "Panic Threshold           : {} uSec",
            st.config.panic_threshold_us
        )?;
        writeln!(
            out,
            "Base ME Prio              : {:#04x}",
            st.config.master_priority
        )?;
        writeln!(
            out,
            "Effective ME Prio         : {:#04x}",
            st.effective_priority()
        )?;
        writeln!(
            out,
            "Auto Disable Allowed      : {}",
            if st.config.auto_disable { "yes" } else { "no" }
        )?;
        writeln!(
            out,
            "Auto Disable Engaged      : {}",
            if st.should_auto_disable() { "yes" } else { "no" }
        )?;
        Ok(())
    }
}
