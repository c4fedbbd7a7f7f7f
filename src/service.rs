//! Public interface facets: time queries for applications and the
//! configuration surface for management tools.
//!
//! Both facets are thin wrappers over the server core.  Pure time queries
//! go straight to the clock objects and never touch the state machine
//! lock; state and configuration calls take it briefly.

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};

use crate::clock::{CommonClock, LocalClock};
use crate::server::{CommonTimeServer, Role};
use crate::{Result, TimeServiceError};

/// Callback interface for common time consumers.
pub trait TimelineListener: Send + Sync {
    /// The shared timeline changed: `Some(id)` after syncing to (or
    /// creating) a timeline, `None` when sync was lost.
    fn on_timeline_changed(&self, timeline_id: Option<u64>);
}

struct CallbackState {
    listeners: Vec<Weak<dyn TimelineListener>>,
    timeline: Option<u64>,
}

/// Registered timeline listeners, shared between the worker thread and
/// the clock facet.
///
/// Two locks, on purpose.  Registration calls reach back into the server
/// core (for auto-disable reevaluation) which takes the state machine
/// lock; the worker thread holds the state machine lock when it delivers
/// notifications, which takes the callback lock.  If registration held
/// the callback lock across its server call, those two paths would
/// deadlock.  So the registration lock is held for the whole registration
/// call, and the callback lock only while the list itself is touched.
pub struct ListenerRegistry {
    registration: Mutex<()>,
    callback: Mutex<CallbackState>,
}

impl ListenerRegistry {
    pub(crate) fn new() -> Self {
        Self {
            registration: Mutex::new(()),
            callback: Mutex::new(CallbackState {
                listeners: Vec::new(),
                timeline: None,
            }),
        }
    }

    pub(crate) fn lock_registration(&self) -> MutexGuard<'_, ()> {
        self.registration.lock()
    }

    /// Add a listener.  Caller must hold the registration lock.
    pub(crate) fn add_locked(&self, listener: &Arc<dyn TimelineListener>) -> Result<()> {
        let mut cb = self.callback.lock();

        let target = Arc::as_ptr(listener) as *const ();
        if cb
            .listeners
            .iter()
            .any(|existing| existing.as_ptr() as *const () == target)
        {
            return Err(TimeServiceError::Lifecycle("listener already registered"));
        }

        cb.listeners.push(Arc::downgrade(listener));
        Ok(())
    }

    /// Remove a listener.  Caller must hold the registration lock.
    pub(crate) fn remove_locked(&self, listener: &Arc<dyn TimelineListener>) -> Result<()> {
        let mut cb = self.callback.lock();

        let target = Arc::as_ptr(listener) as *const ();
        let before = cb.listeners.len();
        cb.listeners
            .retain(|existing| existing.as_ptr() as *const () != target);
        if cb.listeners.len() == before {
            return Err(TimeServiceError::Lifecycle("listener not registered"));
        }
        Ok(())
    }

    /// Count listeners whose peers are still alive, dropping dead ones.
    pub(crate) fn active_count(&self) -> usize {
        let mut cb = self.callback.lock();
        cb.listeners.retain(|listener| listener.strong_count() > 0);
        cb.listeners.len()
    }

    /// Deliver a timeline change to every live listener.  Called by the
    /// worker thread; listeners whose peers have gone away are silently
    /// dropped.
    pub(crate) fn notify_timeline_changed(&self, timeline_id: Option<u64>) {
        let mut cb = self.callback.lock();
        cb.timeline = timeline_id;
        cb.listeners.retain(|weak| match weak.upgrade() {
            Some(listener) => {
                listener.on_timeline_changed(timeline_id);
                true
            }
            None => false,
        });
    }

    /// The timeline last delivered to listeners.
    pub(crate) fn last_notified_timeline(&self) -> Option<u64> {
        self.callback.lock().timeline
    }
}

/// Application-facing clock facet.
#[derive(Clone)]
pub struct ClockService {
    server: Arc<CommonTimeServer>,
    common_clock: Arc<CommonClock>,
    local_clock: Arc<dyn LocalClock>,
}

impl ClockService {
    pub fn new(server: Arc<CommonTimeServer>) -> Self {
        let common_clock = server.common_clock().clone();
        let local_clock = server.local_clock().clone();
        Self {
            server,
            common_clock,
            local_clock,
        }
    }

    /// Whether common time currently has a valid basis, and the timeline
    /// in force.
    pub fn is_common_time_valid(&self) -> (bool, Option<u64>) {
        self.server.is_common_time_valid()
    }

    pub fn common_time_to_local_time(&self, common_time: i64) -> Result<i64> {
        self.common_clock.common_to_local(common_time)
    }

    pub fn local_time_to_common_time(&self, local_time: i64) -> Result<i64> {
        self.common_clock.local_to_common(local_time)
    }

    /// Current common time.
    pub fn get_common_time(&self) -> Result<i64> {
        self.common_clock.local_to_common(self.local_clock.now())
    }

    pub fn get_common_freq(&self) -> u64 {
        self.common_clock.common_freq()
    }

    /// Current local time.
    pub fn get_local_time(&self) -> i64 {
        self.local_clock.now()
    }

    pub fn get_local_freq(&self) -> u64 {
        self.local_clock.frequency()
    }

    /// Estimated sync error in microseconds; `None` when unknown.
    pub fn get_estimated_error(&self) -> Option<i32> {
        self.server.get_estimated_error()
    }

    pub fn get_timeline_id(&self) -> Option<u64> {
        self.server.get_timeline_id()
    }

    pub fn get_state(&self) -> Role {
        self.server.get_state()
    }

    pub fn get_master_addr(&self) -> Option<SocketAddr> {
        self.server.get_master_addr()
    }

    /// Register for timeline change notifications.  Keep the `Arc` alive;
    /// a listener whose last strong reference is dropped is removed
    /// automatically.
    pub fn register_listener(&self, listener: &Arc<dyn TimelineListener>) -> Result<()> {
        let registry = self.server.listener_registry();
        let _guard = registry.lock_registration();
        registry.add_locked(listener)?;
        self.server
            .reevaluate_auto_disable_state(registry.active_count() > 0);
        Ok(())
    }

    pub fn unregister_listener(&self, listener: &Arc<dyn TimelineListener>) -> Result<()> {
        let registry = self.server.listener_registry();
        let _guard = registry.lock_registration();
        registry.remove_locked(listener)?;
        self.server
            .reevaluate_auto_disable_state(registry.active_count() > 0);
        Ok(())
    }

    /// Number of live registered listeners.
    pub fn active_listeners(&self) -> usize {
        let registry = self.server.listener_registry();
        let _guard = registry.lock_registration();
        let count = registry.active_count();
        self.server.reevaluate_auto_disable_state(count > 0);
        count
    }
}

/// Management-facing configuration facet.
#[derive(Clone)]
pub struct ConfigService {
    server: Arc<CommonTimeServer>,
}

impl ConfigService {
    pub fn new(server: Arc<CommonTimeServer>) -> Self {
        Self { server }
    }

    pub fn get_master_election_priority(&self) -> u8 {
        self.server.get_master_election_priority()
    }

    pub fn set_master_election_priority(&self, priority: u8) -> Result<()> {
        self.server.set_master_election_priority(priority)
    }

    pub fn get_master_election_endpoint(&self) -> SocketAddrV4 {
        self.server.get_master_election_endpoint()
    }

    pub fn set_master_election_endpoint(&self, endpoint: SocketAddrV4) -> Result<()> {
        self.server.set_master_election_endpoint(endpoint)
    }

    pub fn get_master_election_group_id(&self) -> u64 {
        self.server.get_master_election_group_id()
    }

    pub fn set_master_election_group_id(&self, group_id: u64) -> Result<()> {
        self.server.set_master_election_group_id(group_id)
    }

    pub fn get_interface_binding(&self) -> Option<String> {
        self.server.get_interface_binding()
    }

    pub fn set_interface_binding(&self, iface: Option<String>) -> Result<()> {
        self.server.set_interface_binding(iface)
    }

    pub fn get_master_announce_interval(&self) -> u32 {
        self.server.get_master_announce_interval()
    }

    pub fn set_master_announce_interval(&self, interval_ms: u32) -> Result<()> {
        self.server.set_master_announce_interval(interval_ms)
    }

    pub fn get_client_sync_interval(&self) -> u32 {
        self.server.get_client_sync_interval()
    }

    pub fn set_client_sync_interval(&self, interval_ms: u32) -> Result<()> {
        self.server.set_client_sync_interval(interval_ms)
    }

    pub fn get_panic_threshold(&self) -> u32 {
        self.server.get_panic_threshold()
    }

    pub fn set_panic_threshold(&self, threshold_us: u32) -> Result<()> {
        self.server.set_panic_threshold(threshold_us)
    }

    pub fn get_auto_disable(&self) -> bool {
        self.server.get_auto_disable()
    }

    pub fn set_auto_disable(&self, auto_disable: bool) -> Result<()> {
        self.server.set_auto_disable(auto_disable)
    }

    pub fn force_networkless_master_mode(&self) -> Result<()> {
        self.server.force_networkless_master_mode()
    }
}
