//! Packet handlers, timeout handlers and role transitions for the state
//! machine.  Everything here runs with the state lock held, either on the
//! worker thread or (for `force_networkless_master_mode`) on a config
//! caller's thread.

use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

use log::error;
use rand::Rng;

use crate::packets::{
    MasterAnnouncement, SyncRequest, SyncResponse, TimePacket, WhoIsMasterRequest,
    WhoIsMasterResponse,
};
use crate::server::{
    Role, ServerState, CLIENT_NUM_SYNC_REQUEST_RETRIES, INITIAL_NUM_WHO_IS_MASTER_RETRIES,
    INITIAL_WHO_IS_MASTER_TIMEOUT_MS, NO_GOOD_DATA_PANIC_THRESHOLD_US,
    RONIN_NUM_WHO_IS_MASTER_RETRIES, RONIN_WHO_IS_MASTER_TIMEOUT_MS,
    RTT_DISCARD_PANIC_THRESH_MULTIPLIER, WAIT_FOR_ELECTION_TIMEOUT_MS,
};

/// Decide between two master candidates.  Returns `true` when the first
/// candidate wins: higher effective priority, then higher device ID.
pub fn arbitrate_master(device_id1: u64, priority1: u8, device_id2: u64, priority2: u8) -> bool {
    priority1 > priority2 || (priority1 == priority2 && device_id1 > device_id2)
}

fn nonzero_timeline(id: u64) -> Option<u64> {
    (id != 0).then_some(id)
}

fn timeline_tag(timeline: Option<u64>) -> u64 {
    timeline.unwrap_or(0)
}

/// Compare endpoints by address only; the source port of election
/// responses is not guaranteed to match the election port.
fn endpoint_matches(a: SocketAddr, b: SocketAddr) -> bool {
    a.ip() == b.ip()
}

impl ServerState {
    pub(crate) fn handle_packet(&mut self, data: &[u8], src: SocketAddr) {
        let packet = match TimePacket::decode(data, self.config.sync_group_id) {
            Ok(packet) => packet,
            Err(e) => {
                let preview: String = data
                    .iter()
                    .take(24)
                    .map(|b| format!("{b:02x}"))
                    .collect::<Vec<_>>()
                    .join(" ");
                self.bad_packet_log.push(format!(
                    "failed to parse {} byte packet from {src}: {e} [{preview}]",
                    data.len()
                ));
                return;
            }
        };

        match packet {
            TimePacket::WhoIsMasterRequest(p) => self.handle_who_is_master_request(&p, src),
            TimePacket::WhoIsMasterResponse(p) => self.handle_who_is_master_response(&p, src),
            TimePacket::SyncRequest(p) => self.handle_sync_request(&p, src),
            TimePacket::SyncResponse(p) => self.handle_sync_response(&p, src),
            TimePacket::MasterAnnouncement(p) => self.handle_master_announcement(&p, src),
        }
    }

    pub(crate) fn handle_who_is_master_request(
        &mut self,
        request: &WhoIsMasterRequest,
        src: SocketAddr,
    ) {
        // Skip our own traffic looping back from the broadcast address.
        if Some(request.sender_device_id) == self.device_id {
            return;
        }

        self.election_log.push(format!(
            "RX WhoIsMaster request in {} from {src}: reqTID {:016x} ourTID {:016x}",
            self.role,
            request.timeline_id,
            timeline_tag(self.timeline)
        ));

        match self.role {
            Role::Master => {
                // Only answer for our own timeline (or an open query).
                if request.timeline_id != 0 && Some(request.timeline_id) != self.timeline {
                    return;
                }

                let response = WhoIsMasterResponse {
                    timeline_id: timeline_tag(self.timeline),
                    group_id: self.config.sync_group_id,
                    device_id: self.device_id.unwrap_or(0),
                    priority: self.effective_priority(),
                };
                self.election_log.push(format!(
                    "TX WhoIsMaster response to {src} in {}: ourTID {:016x} prio {:#04x}",
                    self.role, response.timeline_id, response.priority
                ));
                self.send_packet(&TimePacket::WhoIsMasterResponse(response), src);
            }
            Role::Ronin => {
                // A peer sweeping for the same lost timeline: if it would
                // win the election, stand down and wait for its
                // announcement.
                if nonzero_timeline(request.timeline_id) != self.timeline {
                    return;
                }

                if arbitrate_master(
                    request.sender_device_id,
                    request.sender_priority,
                    self.device_id.unwrap_or(0),
                    self.effective_priority(),
                ) {
                    self.become_wait_for_election("would lose election");
                }
            }
            Role::Initial => {
                // Simultaneous cold boots would all time out to master at
                // once.  When a peer that would beat us is also searching,
                // restart our own countdown so the winner claims the
                // timeline first.
                if request.timeline_id == 0
                    && arbitrate_master(
                        request.sender_device_id,
                        request.sender_priority,
                        self.device_id.unwrap_or(0),
                        self.effective_priority(),
                    )
                {
                    self.initial_who_is_master_timeouts = 0;
                }
            }
            _ => {}
        }
    }

    pub(crate) fn handle_who_is_master_response(
        &mut self,
        response: &WhoIsMasterResponse,
        src: SocketAddr,
    ) {
        if Some(response.device_id) == self.device_id {
            return;
        }

        self.election_log.push(format!(
            "RX WhoIsMaster response in {} from {src}: respTID {:016x} respDID {:014x} \
             respPrio {:#04x} ourTID {:016x}",
            self.role,
            response.timeline_id,
            response.device_id,
            response.priority,
            timeline_tag(self.timeline)
        ));

        match self.role {
            Role::Initial | Role::Ronin => {
                self.become_client(
                    src,
                    response.device_id,
                    response.priority,
                    response.timeline_id,
                    "heard whois response",
                );
            }
            Role::Client => {
                // Multiple devices believe they are master; follow the one
                // that wins arbitration.
                if arbitrate_master(
                    response.device_id,
                    response.priority,
                    self.client_master_device_id,
                    self.client_master_priority,
                ) {
                    self.become_client(
                        src,
                        response.device_id,
                        response.priority,
                        response.timeline_id,
                        "heard whois response",
                    );
                }
            }
            _ => {}
        }
    }

    pub(crate) fn handle_sync_request(&mut self, request: &SyncRequest, src: SocketAddr) {
        let response = if self.role == Role::Master
            && nonzero_timeline(request.timeline_id) == self.timeline
            && self.timeline.is_some()
        {
            // Answering an actual client on a live network: we are a real
            // master now, drop the low-priority hold-off.
            self.set_force_low_priority(false);

            let rx_common = match self.common_clock.local_to_common(self.last_packet_rx_local) {
                Ok(value) => value,
                Err(e) => {
                    error!("master cannot convert sync RX time: {e}");
                    return;
                }
            };
            let tx_local = self.local_clock.now();
            let tx_common = match self.common_clock.local_to_common(tx_local) {
                Ok(value) => value,
                Err(e) => {
                    error!("master cannot convert sync TX time: {e}");
                    return;
                }
            };

            SyncResponse {
                timeline_id: timeline_tag(self.timeline),
                group_id: self.config.sync_group_id,
                client_tx_local: request.client_tx_local,
                master_rx_common: rx_common,
                master_tx_common: tx_common,
                nak: 0,
            }
        } else {
            SyncResponse {
                timeline_id: timeline_tag(self.timeline),
                group_id: self.config.sync_group_id,
                client_tx_local: 0,
                master_rx_common: 0,
                master_tx_common: 0,
                nak: 1,
            }
        };

        self.send_packet(&TimePacket::SyncResponse(response), src);
    }

    pub(crate) fn handle_sync_response(&mut self, response: &SyncResponse, src: SocketAddr) {
        if self.role != Role::Client {
            return;
        }

        let master_ep = match self.master_ep {
            Some(ep) => ep,
            None => return,
        };
        if !endpoint_matches(src, master_ep) {
            log::info!("dropping sync response from unexpected address {src}, expected {master_ep}");
            return;
        }

        if response.nak != 0 {
            // Our master is no longer serving this timeline.
            self.become_ronin("master NAK'ed");
            return;
        }

        self.sync_request_pending = false;
        self.sync_request_timeouts = 0;
        self.rtt_log
            .log_rx(response.client_tx_local, self.last_packet_rx_local);
        self.sync_resps_rxed_from_cur_master += 1;

        if self.sync_resps_rxed_from_cur_master == 1 {
            // The first exchange with a new master can be delayed by ARP
            // resolution on either leg; its timing is worthless.
        } else {
            let client_tx_local = response.client_tx_local;
            let client_rx_local = self.last_packet_rx_local;

            let rtt = client_rx_local - client_tx_local;
            let avg_local = (client_tx_local + client_rx_local) >> 1;
            let avg_common = (response.master_tx_common + response.master_rx_common) >> 1;

            let rtt_common = self
                .common_clock
                .local_duration_to_common_duration(rtt)
                .unwrap_or(i64::MAX);
            let discard_thresh =
                self.config.panic_threshold_us as i64 * RTT_DISCARD_PANIC_THRESH_MULTIPLIER;
            if rtt_common > discard_thresh {
                // An RTT that far out tells us nothing useful; doing
                // nothing beats taking cues from it.
                log::debug!("dropping sync response with RTT of {rtt_common} usec");
                self.expired_sync_resps_rxed_from_cur_master += 1;
                if self.should_panic_not_getting_good_data() {
                    self.become_initial("rx panic, no good data");
                    return;
                }
            } else {
                let disciplined =
                    self.recovery
                        .push_discipline_event(avg_local, avg_common, rtt_common);
                self.last_good_sync_rx = Some(client_rx_local);

                if disciplined {
                    self.notify_clock_sync();
                } else {
                    error!(
                        "observed clock sync error is too high to tolerate, \
                         resetting state machine and starting over"
                    );
                    self.notify_clock_sync_loss();
                    self.become_initial("panic");
                    return;
                }
            }
        }

        let now = self.local_clock.now();
        self.cur_timeout.set(now, self.config.client_sync_interval_ms);
    }

    pub(crate) fn handle_master_announcement(
        &mut self,
        packet: &MasterAnnouncement,
        src: SocketAddr,
    ) {
        if Some(packet.device_id) == self.device_id {
            return;
        }

        self.election_log.push(format!(
            "RX master announcement in {} from {src}: srcDID {:014x} srcPrio {:#04x} \
             srcTID {:016x}",
            self.role, packet.device_id, packet.priority, packet.timeline_id
        ));

        match self.role {
            Role::Initial | Role::Ronin | Role::WaitForElection => {
                self.become_client(
                    src,
                    packet.device_id,
                    packet.priority,
                    packet.timeline_id,
                    "heard master announcement",
                );
            }
            Role::Client => {
                if arbitrate_master(
                    packet.device_id,
                    packet.priority,
                    self.client_master_device_id,
                    self.client_master_priority,
                ) {
                    self.become_client(
                        src,
                        packet.device_id,
                        packet.priority,
                        packet.timeline_id,
                        "heard master announcement",
                    );
                }
            }
            Role::Master => {
                // Two masters are competing; concede to the winner.
                if arbitrate_master(
                    packet.device_id,
                    packet.priority,
                    self.device_id.unwrap_or(0),
                    self.effective_priority(),
                ) {
                    self.become_client(
                        src,
                        packet.device_id,
                        packet.priority,
                        packet.timeline_id,
                        "heard master announcement",
                    );
                }
            }
        }
    }

    pub(crate) fn handle_timeout(&mut self) {
        // With no socket this can only be the setup-retry tick; the event
        // loop re-attempts the rebuild on its own.
        if self.socket.is_none() {
            return;
        }

        match self.role {
            Role::Initial => self.handle_timeout_initial(),
            Role::Client => self.handle_timeout_client(),
            Role::Master => self.handle_timeout_master(),
            Role::Ronin => self.handle_timeout_ronin(),
            Role::WaitForElection => self.handle_timeout_wait_for_election(),
        }
    }

    fn handle_timeout_initial(&mut self) {
        self.initial_who_is_master_timeouts += 1;
        if self.initial_who_is_master_timeouts == INITIAL_NUM_WHO_IS_MASTER_RETRIES {
            // Nobody answered; the timeline is ours to create.
            self.become_master("initial timeout");
        } else {
            self.send_who_is_master_request();
        }
    }

    fn handle_timeout_client(&mut self) {
        if self.should_panic_not_getting_good_data() {
            self.become_initial("timeout panic, no good data");
            return;
        }

        if self.sync_request_pending {
            self.sync_request_pending = false;
            self.sync_request_timeouts += 1;
            if self.sync_request_timeouts < CLIENT_NUM_SYNC_REQUEST_RETRIES {
                self.send_sync_request();
            } else {
                // The master went quiet for too long; assume it is dead
                // and elect a replacement.
                self.become_ronin("master not responding");
            }
        } else {
            self.send_sync_request();
        }
    }

    fn handle_timeout_master(&mut self) {
        self.send_master_announcement();
    }

    fn handle_timeout_ronin(&mut self) {
        self.ronin_who_is_master_timeouts += 1;
        if self.ronin_who_is_master_timeouts == RONIN_NUM_WHO_IS_MASTER_RETRIES {
            self.become_master("no better masters detected");
        } else {
            self.send_who_is_master_request();
        }
    }

    fn handle_timeout_wait_for_election(&mut self) {
        self.become_ronin("timeout waiting for election conclusion");
    }

    pub(crate) fn send_who_is_master_request(&mut self) {
        // With no socket we must be in the unconfigured initial state;
        // stay quiet until the network shows up or networkless master
        // mode is forced.
        if self.socket.is_none() {
            return;
        }

        let request = WhoIsMasterRequest {
            timeline_id: timeline_tag(self.timeline),
            group_id: self.config.sync_group_id,
            sender_device_id: self.device_id.unwrap_or(0),
            sender_priority: self.effective_priority(),
        };

        self.election_log.push(format!(
            "TX WhoIsMaster request to {} in {}: ourTID {:016x} ourDID {:014x} prio {:#04x}",
            self.config.election_endpoint,
            self.role,
            request.timeline_id,
            request.sender_device_id,
            request.sender_priority
        ));

        let dest = SocketAddr::V4(self.config.election_endpoint);
        self.send_packet(&TimePacket::WhoIsMasterRequest(request), dest);

        let now = self.local_clock.now();
        let timeout_ms = if self.role == Role::Initial {
            INITIAL_WHO_IS_MASTER_TIMEOUT_MS
        } else {
            RONIN_WHO_IS_MASTER_TIMEOUT_MS
        };
        self.cur_timeout.set(now, timeout_ms);
    }

    pub(crate) fn send_sync_request(&mut self) {
        let tx_local = self.local_clock.now();
        let request = SyncRequest {
            timeline_id: timeline_tag(self.timeline),
            group_id: self.config.sync_group_id,
            client_tx_local: tx_local,
        };

        if self.first_sync_tx.is_none() {
            self.first_sync_tx = Some(tx_local);
        }
        self.rtt_log.log_tx(tx_local);

        if let Some(master_ep) = self.master_ep {
            self.send_packet(&TimePacket::SyncRequest(request), master_ep);
        }

        self.syncs_sent_to_cur_master += 1;
        let now = self.local_clock.now();
        self.cur_timeout.set(now, self.config.client_sync_interval_ms);
        self.sync_request_pending = true;
    }

    pub(crate) fn send_master_announcement(&mut self) {
        // In networkless master mode there is nobody to announce to.  The
        // worker gets poked when the network comes back.
        if self.socket.is_none() {
            self.cur_timeout.clear();
            return;
        }

        let announcement = MasterAnnouncement {
            timeline_id: timeline_tag(self.timeline),
            group_id: self.config.sync_group_id,
            device_id: self.device_id.unwrap_or(0),
            priority: self.effective_priority(),
        };

        self.election_log.push(format!(
            "TX master announcement to {} in {}: ourTID {:016x} ourDID {:014x} prio {:#04x}",
            self.config.election_endpoint,
            self.role,
            announcement.timeline_id,
            announcement.device_id,
            announcement.priority
        ));

        let dest = SocketAddr::V4(self.config.election_endpoint);
        self.send_packet(&TimePacket::MasterAnnouncement(announcement), dest);

        let now = self.local_clock.now();
        self.cur_timeout
            .set(now, self.config.master_announce_interval_ms);
    }

    pub(crate) fn become_client(
        &mut self,
        master_ep: SocketAddr,
        master_device_id: u64,
        master_priority: u8,
        timeline_id: u64,
        cause: &str,
    ) {
        let new_timeline = nonzero_timeline(timeline_id);
        let line = format!(
            "{} --> CLIENT ({cause}):{} old master {:#04x}-{:014x}::{:016x} \
             new master {:#04x}-{:014x}::{:016x}::{master_ep}",
            self.role,
            if self.timeline != new_timeline {
                " (new timeline)"
            } else {
                ""
            },
            self.client_master_priority,
            self.client_master_device_id,
            timeline_tag(self.timeline),
            master_priority,
            master_device_id,
            timeline_id,
        );
        self.state_change_log.push_logged(log::Level::Info, line);

        if self.timeline != new_timeline {
            // Following a brand new timeline: the old basis means nothing.
            self.timeline = new_timeline;
            self.recovery.reset(true, true);
            self.notify_clock_sync_loss();
        } else {
            // Same timeline, new master: keep position, restart frequency
            // tracking.
            self.recovery.reset(false, true);
        }

        self.master_ep = Some(master_ep);

        // We are following a real master on a real network now.  Should it
        // disappear, we compete for succession at full priority.
        self.set_force_low_priority(false);

        self.client_master_device_id = master_device_id;
        self.client_master_priority = master_priority;
        self.reset_sync_stats();

        self.role = Role::Client;

        // Spread out the first sync of the clients that just heard an
        // announcement so they do not all hit the master at once.
        let jitter_ms = rand::thread_rng().gen_range(0..100);
        thread::sleep(Duration::from_millis(jitter_ms));

        self.send_sync_request();
    }

    pub(crate) fn become_master(&mut self, cause: &str) {
        let old_timeline = self.timeline;
        if self.timeline.is_none() {
            // Nothing followed so far: create a brand new timeline with
            // common time starting at zero, now.
            self.common_clock.set_basis(self.local_clock.now(), 0);
            self.assign_timeline_id();
            self.notify_clock_sync();
        }

        let line = format!(
            "{} --> MASTER ({cause}): {} timeline {:016x}",
            self.role,
            if old_timeline == self.timeline {
                "taking ownership of"
            } else {
                "creating new"
            },
            timeline_tag(self.timeline)
        );
        self.state_change_log.push_logged(log::Level::Info, line);

        self.master_ep = None;
        self.set_force_low_priority(false);
        self.client_master_priority = self.effective_priority();
        self.client_master_device_id = self.device_id.unwrap_or(0);
        self.recovery.reset(false, true);
        self.reset_sync_stats();

        self.role = Role::Master;
        self.send_master_announcement();
    }

    pub(crate) fn become_ronin(&mut self, cause: &str) {
        self.master_ep = None;

        if self.common_clock.is_valid() {
            let line = format!(
                "{} --> RONIN ({cause}): lost valid timeline {:016x} \
                 ({} TXed {} RXed {} RXExpired)",
                self.role,
                timeline_tag(self.timeline),
                self.syncs_sent_to_cur_master,
                self.sync_resps_rxed_from_cur_master,
                self.expired_sync_resps_rxed_from_cur_master,
            );
            self.state_change_log.push_logged(log::Level::Info, line);

            self.ronin_who_is_master_timeouts = 0;
            self.role = Role::Ronin;
            self.send_who_is_master_request();
        } else {
            // We never actually synced to this timeline.  Becoming its
            // master would mean serving a time we never knew; restart from
            // scratch instead, and let a peer that did sync take over.
            let line = format!(
                "{} --> INITIAL ({cause}): never synced timeline {:016x} \
                 ({} TXed {} RXed {} RXExpired)",
                self.role,
                timeline_tag(self.timeline),
                self.syncs_sent_to_cur_master,
                self.sync_resps_rxed_from_cur_master,
                self.expired_sync_resps_rxed_from_cur_master,
            );
            self.state_change_log.push_logged(log::Level::Info, line);

            self.become_initial("ronin, no timeline");
        }
    }

    pub(crate) fn become_wait_for_election(&mut self, cause: &str) {
        let line = format!(
            "{} --> WAIT_FOR_ELECTION ({cause}): waiting {WAIT_FOR_ELECTION_TIMEOUT_MS} ms \
             for completion",
            self.role
        );
        self.state_change_log.push_logged(log::Level::Info, line);

        self.role = Role::WaitForElection;
        let now = self.local_clock.now();
        self.cur_timeout.set(now, WAIT_FOR_ELECTION_TIMEOUT_MS);
    }

    pub(crate) fn become_initial(&mut self, cause: &str) {
        self.state_change_log.push_logged(
            log::Level::Info,
            format!("entering INITIAL ({cause}), total reset"),
        );

        self.role = Role::Initial;

        self.recovery.reset(true, true);

        self.cur_timeout.clear();
        self.master_ep = None;
        self.last_packet_rx_local = 0;
        self.timeline = None;
        self.clock_synced = false;
        self.initial_who_is_master_timeouts = 0;
        self.client_master_device_id = 0;
        self.client_master_priority = 0;
        self.ronin_who_is_master_timeouts = 0;
        self.reset_sync_stats();

        self.send_who_is_master_request();
    }

    pub(crate) fn should_panic_not_getting_good_data(&self) -> bool {
        let first_sync_tx = match self.first_sync_tx {
            Some(tx) => tx,
            None => return false,
        };

        let now = self.local_clock.now();
        let basis = self.last_good_sync_rx.unwrap_or(first_sync_tx);
        match self.common_clock.local_duration_to_common_duration(now - basis) {
            Ok(usec) => usec >= NO_GOOD_DATA_PANIC_THRESHOLD_US,
            Err(_) => true,
        }
    }
}
