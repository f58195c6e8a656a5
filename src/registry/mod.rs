//! Connection and account registry: the single serialized owner of the
//! driver, user, and session tables plus the bidirectional indexes
//! between connection identity, account identity, and session key.
//!
//! All methods take the coarse lock, mutate, and return plain outcome
//! values. Nothing here touches the transport: recipient connection ids
//! and payloads are handed back to the caller, which publishes them
//! after the lock is released.

pub mod driver;
pub mod rate;
pub mod session;
pub mod snapshot;
pub mod user;

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::RelayError;
use crate::filter::{self, BroadcastTrigger};
use crate::ws::ConnectionId;

use self::driver::{DriverRecord, LocationPatch, WaitingPassenger};
use self::session::{mint_session_key, Role, SessionRecord};
use self::snapshot::{compose_snapshot, DriverView, SnapshotData};
use self::user::UserRecord;

/// What a connection is, once it has registered or resumed.
#[derive(Debug, Clone)]
pub struct Binding {
    pub role: Role,
    /// None only for driver connections whose identity has not arrived yet.
    pub account_id: Option<String>,
}

#[derive(Debug)]
pub struct RegisterOutcome {
    pub session_key: String,
    pub role: Role,
    /// Incumbent connections to notify with `connectionReplaced` and close.
    pub preempted: Vec<ConnectionId>,
}

#[derive(Debug)]
pub struct ResumeOutcome {
    pub role: Role,
    pub account_id: Option<String>,
    pub preempted: Vec<ConnectionId>,
}

/// `pingRemoved` to deliver to one driver about one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingRemovalNotice {
    pub driver_conn: ConnectionId,
    pub user_account_id: String,
}

#[derive(Debug, Default)]
pub struct UnbindOutcome {
    pub role: Option<Role>,
    pub account_id: Option<String>,
    pub ping_removals: Vec<PingRemovalNotice>,
}

#[derive(Debug)]
pub struct EndOutcome {
    pub account_id: String,
}

/// Result of merging one driver event into the table.
#[derive(Debug)]
pub struct UpdateOutcome {
    pub account_id: String,
    /// Merged view to fan out, when the filter fired.
    pub broadcast: Option<DriverView>,
    pub trigger: Option<BroadcastTrigger>,
    /// Deferred `driverStateRestored`, released by this update.
    pub restored: Option<DriverView>,
    pub preempted: Vec<ConnectionId>,
}

#[derive(Debug)]
pub struct PingOutcome {
    pub driver_conn: ConnectionId,
    pub user_account_id: String,
    pub lat: f64,
    pub lng: f64,
    pub requested_count: u32,
}

#[derive(Debug)]
pub struct UnpingOutcome {
    pub driver_conn: Option<ConnectionId>,
    pub user_account_id: String,
}

#[derive(Debug, Default)]
pub struct SweepOutcome {
    pub removed_drivers: Vec<String>,
    pub removed_users: Vec<String>,
    pub ping_removals: Vec<PingRemovalNotice>,
}

#[derive(Default)]
struct RegistryInner {
    drivers: HashMap<String, DriverRecord>,
    users: HashMap<String, UserRecord>,
    sessions: HashMap<String, SessionRecord>,
    /// connection -> role + account
    bindings: HashMap<ConnectionId, Binding>,
    /// account -> live connection (at most one, across both cohorts)
    account_conns: HashMap<String, ConnectionId>,
    /// session key -> live connection
    session_conns: HashMap<String, ConnectionId>,
    /// live connection -> session key
    conn_sessions: HashMap<ConnectionId, String>,
}

pub struct Registry {
    inner: Mutex<RegistryInner>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        // A poisoning panic can only have happened outside a mutation
        // (handlers are wrapped); the tables are still consistent.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Bind a fresh registration. Preempts any incumbent connection for
    /// the account, replaces any session this connection already held,
    /// and mints a new session key.
    pub fn register(
        &self,
        conn: ConnectionId,
        role: Role,
        account_id: Option<String>,
        now: Instant,
    ) -> Result<RegisterOutcome, RelayError> {
        let account_id = account_id.filter(|a| !a.is_empty());
        if role == Role::User && account_id.is_none() {
            return Err(RelayError::validation("accountId is required for user role"));
        }

        let mut inner = self.lock();
        inner.drop_replaced_session(conn);

        let mut preempted = Vec::new();
        if let Some(account) = &account_id {
            preempted.extend(inner.preempt_account(account, conn));
            inner.account_conns.insert(account.clone(), conn);
        }

        let session_key = mint_session_key();
        inner
            .sessions
            .insert(session_key.clone(), SessionRecord::new(role, account_id.clone(), now));
        inner.session_conns.insert(session_key.clone(), conn);
        inner.conn_sessions.insert(conn, session_key.clone());
        inner.bindings.insert(
            conn,
            Binding {
                role,
                account_id: account_id.clone(),
            },
        );

        if let Some(account) = &account_id {
            match role {
                Role::User => {
                    inner
                        .users
                        .entry(account.clone())
                        .and_modify(|u| u.bind(conn, now))
                        .or_insert_with(|| UserRecord::new(account.clone(), conn, now));
                }
                Role::Driver => {
                    // An existing record means this is a comeback: defer
                    // driverStateRestored until the first authoritative
                    // update so the merged occupancy wins.
                    if let Some(record) = inner.drivers.get_mut(account) {
                        record.pending_state_restore = true;
                    }
                }
            }
        }

        Ok(RegisterOutcome {
            session_key,
            role,
            preempted,
        })
    }

    /// Reclaim a prior logical session by key.
    pub fn resume_session(
        &self,
        conn: ConnectionId,
        session_key: &str,
        now: Instant,
    ) -> Result<ResumeOutcome, RelayError> {
        let mut inner = self.lock();

        let (role, account_id) = match inner.sessions.get(session_key) {
            Some(session) => (session.role, session.account_id.clone()),
            None => {
                return Err(RelayError::Session(
                    "unknown session key, register again".to_string(),
                ))
            }
        };

        let mut preempted = Vec::new();
        if let Some(&incumbent) = inner.session_conns.get(session_key) {
            if incumbent != conn {
                inner.detach_conn(incumbent);
                preempted.push(incumbent);
            }
        }
        // A connection switching to another session drops its old one.
        if inner.conn_sessions.get(&conn).map(String::as_str) != Some(session_key) {
            inner.drop_replaced_session(conn);
        }

        if let Some(account) = &account_id {
            for old in inner.preempt_account(account, conn) {
                if !preempted.contains(&old) {
                    preempted.push(old);
                }
            }
            inner.account_conns.insert(account.clone(), conn);
        }

        inner.session_conns.insert(session_key.to_string(), conn);
        inner.conn_sessions.insert(conn, session_key.to_string());
        inner.bindings.insert(
            conn,
            Binding {
                role,
                account_id: account_id.clone(),
            },
        );
        if let Some(session) = inner.sessions.get_mut(session_key) {
            session.last_activity_at = now;
        }

        if let Some(account) = &account_id {
            match role {
                Role::Driver => {
                    if let Some(record) = inner.drivers.get_mut(account) {
                        record.bind(conn);
                        record.pending_state_restore = true;
                    }
                }
                Role::User => {
                    inner
                        .users
                        .entry(account.clone())
                        .and_modify(|u| u.bind(conn, now))
                        .or_insert_with(|| UserRecord::new(account.clone(), conn, now));
                }
            }
        }

        Ok(ResumeOutcome {
            role,
            account_id,
            preempted,
        })
    }

    /// Drop a connection from every index and move its endpoint into the
    /// disconnected-with-grace substate. The session record survives so
    /// the client can resume.
    pub fn unbind(&self, conn: ConnectionId, now: Instant) -> UnbindOutcome {
        let mut inner = self.lock();
        inner.unbind_conn(conn, now)
    }

    /// Explicit driver teardown: record, session, and binding all go,
    /// immediately and without grace.
    pub fn end_session(&self, conn: ConnectionId) -> Result<EndOutcome, RelayError> {
        let mut inner = self.lock();
        let account = match inner.bindings.get(&conn) {
            Some(binding) => binding
                .account_id
                .clone()
                .ok_or_else(|| RelayError::validation("no driver identity bound to this connection"))?,
            None => return Err(RelayError::authorization("connection is not registered")),
        };

        inner.drivers.remove(&account);
        if inner.account_conns.get(&account) == Some(&conn) {
            inner.account_conns.remove(&account);
        }
        inner.drop_replaced_session(conn);
        inner.bindings.remove(&conn);

        Ok(EndOutcome { account_id: account })
    }

    /// Merge an `updateLocation` event and run the broadcast filter.
    #[allow(clippy::too_many_arguments)]
    pub fn apply_location(
        &self,
        conn: ConnectionId,
        account_id: &str,
        lat: f64,
        lng: f64,
        patch: &LocationPatch,
        now: Instant,
        movement_threshold_deg: f64,
        heartbeat_interval: Duration,
    ) -> Result<UpdateOutcome, RelayError> {
        let mut inner = self.lock();
        let preempted = inner.bind_driver_identity(conn, account_id)?;

        let trigger = filter::location_trigger(
            inner.drivers.get(account_id),
            lat,
            lng,
            patch.passenger_count,
            patch.max_capacity,
            now,
            movement_threshold_deg,
            heartbeat_interval,
        );

        let record = inner.driver_entry(conn, account_id, now);
        record.merge_location(lat, lng, patch, now);

        let broadcast = if trigger.is_some() {
            record.mark_broadcast(now);
            Some(DriverView::from_record(record))
        } else {
            None
        };
        let restored = take_pending_restore(record);

        Ok(UpdateOutcome {
            account_id: account_id.to_string(),
            broadcast,
            trigger,
            restored,
            preempted,
        })
    }

    /// Merge a `destinationUpdate`. Always broadcast.
    pub fn apply_destination(
        &self,
        conn: ConnectionId,
        account_id: &str,
        patch: &LocationPatch,
        now: Instant,
    ) -> Result<UpdateOutcome, RelayError> {
        let mut inner = self.lock();
        let preempted = inner.bind_driver_identity(conn, account_id)?;

        let record = inner.driver_entry(conn, account_id, now);
        record.merge_patch(patch, now);

        Ok(UpdateOutcome {
            account_id: account_id.to_string(),
            broadcast: Some(DriverView::from_record(record)),
            trigger: None,
            restored: None,
            preempted,
        })
    }

    /// Merge a `routeUpdate`. Broadcast only when the geometry or the
    /// destination coordinates actually changed.
    pub fn apply_route(
        &self,
        conn: ConnectionId,
        account_id: &str,
        geometry: Value,
        destination_lat: Option<f64>,
        destination_lng: Option<f64>,
        now: Instant,
    ) -> Result<UpdateOutcome, RelayError> {
        let mut inner = self.lock();
        let preempted = inner.bind_driver_identity(conn, account_id)?;

        let changed = filter::route_changed(
            inner.drivers.get(account_id),
            &geometry,
            destination_lat,
            destination_lng,
        );

        let record = inner.driver_entry(conn, account_id, now);
        record.route_geometry = Some(geometry);
        if destination_lat.is_some() {
            record.destination_lat = destination_lat;
        }
        if destination_lng.is_some() {
            record.destination_lng = destination_lng;
        }
        record.last_updated_at = now;

        let broadcast = changed.then(|| DriverView::from_record(record));

        Ok(UpdateOutcome {
            account_id: account_id.to_string(),
            broadcast,
            trigger: None,
            restored: None,
            preempted,
        })
    }

    /// Merge a `passengerUpdate`. Broadcast only on an occupancy delta.
    pub fn apply_passengers(
        &self,
        conn: ConnectionId,
        account_id: &str,
        passenger_count: Option<u32>,
        max_capacity: Option<u32>,
        now: Instant,
    ) -> Result<UpdateOutcome, RelayError> {
        let mut inner = self.lock();
        let preempted = inner.bind_driver_identity(conn, account_id)?;

        let changed = match inner.drivers.get(account_id) {
            Some(prior) => filter::occupancy_changed(prior, passenger_count, max_capacity),
            None => true,
        };

        let record = inner.driver_entry(conn, account_id, now);
        record.merge_patch(
            &LocationPatch {
                passenger_count,
                max_capacity,
                ..Default::default()
            },
            now,
        );

        let broadcast = changed.then(|| DriverView::from_record(record));
        let restored = take_pending_restore(record);

        Ok(UpdateOutcome {
            account_id: account_id.to_string(),
            broadcast,
            trigger: None,
            restored,
            preempted,
        })
    }

    /// Record a user ping against a live driver. `is_live` reports whether
    /// a connection currently has a writable transport, so a dead driver
    /// fails the request before anything is stored.
    #[allow(clippy::too_many_arguments)]
    pub fn ping_driver(
        &self,
        user_conn: ConnectionId,
        driver_account_id: &str,
        lat: f64,
        lng: f64,
        requested_count: u32,
        pinged_at_ms: i64,
        now: Instant,
        is_live: impl Fn(ConnectionId) -> bool,
    ) -> Result<PingOutcome, RelayError> {
        let mut inner = self.lock();
        let user_account = inner.user_account(user_conn)?;

        let driver = inner
            .drivers
            .get_mut(driver_account_id)
            .ok_or_else(|| RelayError::not_found(format!("unknown driver: {driver_account_id}")))?;
        let driver_conn = driver
            .connection
            .filter(|&c| is_live(c))
            .ok_or_else(|| RelayError::unavailable("driver is not connected"))?;

        driver.waiting_passengers.insert(
            user_account.clone(),
            WaitingPassenger {
                lat,
                lng,
                requested_count,
                pinged_at_ms,
            },
        );

        if let Some(user) = inner.users.get_mut(&user_account) {
            user.lat = Some(lat);
            user.lng = Some(lng);
            user.touch(now);
        }

        Ok(PingOutcome {
            driver_conn,
            user_account_id: user_account,
            lat,
            lng,
            requested_count,
        })
    }

    /// Withdraw a user's ping. Idempotent on the waiting entry.
    pub fn unping_driver(
        &self,
        user_conn: ConnectionId,
        driver_account_id: &str,
    ) -> Result<UnpingOutcome, RelayError> {
        let mut inner = self.lock();
        let user_account = inner.user_account(user_conn)?;

        let driver = inner
            .drivers
            .get_mut(driver_account_id)
            .ok_or_else(|| RelayError::not_found(format!("unknown driver: {driver_account_id}")))?;
        driver.waiting_passengers.remove(&user_account);

        Ok(UnpingOutcome {
            driver_conn: driver.connection,
            user_account_id: user_account,
        })
    }

    /// Activity touch for every inbound message on a bound connection.
    pub fn touch_activity(&self, conn: ConnectionId, now: Instant) {
        let mut inner = self.lock();
        if let Some(key) = inner.conn_sessions.get(&conn).cloned() {
            if let Some(session) = inner.sessions.get_mut(&key) {
                session.last_activity_at = now;
            }
        }
        let account = match inner.bindings.get(&conn) {
            Some(Binding {
                role: Role::User,
                account_id: Some(account),
            }) => account.clone(),
            _ => return,
        };
        if let Some(user) = inner.users.get_mut(&account) {
            user.touch(now);
        }
    }

    pub fn role_of(&self, conn: ConnectionId) -> Option<Role> {
        self.lock().bindings.get(&conn).map(|b| b.role)
    }

    pub fn bound_account(&self, conn: ConnectionId) -> Option<String> {
        self.lock().bindings.get(&conn).and_then(|b| b.account_id.clone())
    }

    pub fn bus_info(&self, account_id: &str) -> Option<DriverView> {
        self.lock().drivers.get(account_id).map(DriverView::from_record)
    }

    /// Full driver list (legacy `driversData` shape, uncapped).
    pub fn drivers_data(&self) -> Vec<DriverView> {
        self.lock().drivers.values().map(DriverView::from_record).collect()
    }

    /// Capped point-in-time snapshot (`driversSnapshot` / `currentData`).
    pub fn snapshot(&self, max_drivers: usize) -> SnapshotData {
        compose_snapshot(self.lock().drivers.values(), max_drivers)
    }

    pub fn driver_count(&self) -> usize {
        self.lock().drivers.len()
    }

    /// Connection ids of the user cohort, captured under the lock for
    /// fan-out outside it.
    pub fn user_connections(&self) -> Vec<ConnectionId> {
        self.lock()
            .bindings
            .iter()
            .filter(|(_, b)| b.role == Role::User)
            .map(|(&conn, _)| conn)
            .collect()
    }

    /// Reaper sweep: reconcile records against live transport state, purge
    /// stale-past-grace endpoints, and GC orphaned sessions. Idempotent
    /// with respect to `endSession` and to itself.
    pub fn sweep(
        &self,
        now: Instant,
        grace_period: Duration,
        stale_timeout: Duration,
        is_live: impl Fn(ConnectionId) -> bool,
    ) -> SweepOutcome {
        let mut inner = self.lock();
        let mut outcome = SweepOutcome::default();

        // 1. Transport reconciliation: bound connections whose transport
        //    is gone behave exactly like an unbind.
        let dead: Vec<ConnectionId> = inner
            .bindings
            .keys()
            .copied()
            .filter(|&c| !is_live(c))
            .collect();
        for conn in dead {
            let unbound = inner.unbind_conn(conn, now);
            outcome.ping_removals.extend(unbound.ping_removals);
        }
        // Records can also hold a lingering handle no binding knows about
        // (preemption leftovers). Detach those too.
        let lingering: Vec<String> = inner
            .drivers
            .iter()
            .filter(|(_, r)| r.connection.is_some_and(|c| !is_live(c)))
            .map(|(account, _)| account.clone())
            .collect();
        for account in lingering {
            if let Some(record) = inner.drivers.get_mut(&account) {
                record.mark_disconnected(now);
            }
        }

        // 2. Stale purge, subject to the grace window.
        let expired_drivers: Vec<String> = inner
            .drivers
            .values()
            .filter(|r| r.is_stale(now, stale_timeout) && !r.in_grace(now, grace_period))
            .map(|r| r.account_id.clone())
            .collect();
        for account in &expired_drivers {
            inner.drivers.remove(account);
        }
        outcome.removed_drivers = expired_drivers;

        let expired_users: Vec<String> = inner
            .users
            .values()
            .filter(|u| u.is_stale(now, stale_timeout) && !u.in_grace(now, grace_period))
            .map(|u| u.account_id.clone())
            .collect();
        for account in &expired_users {
            inner.users.remove(account);
            outcome.ping_removals.extend(inner.prune_waiting(account));
        }
        outcome.removed_users = expired_users;

        // 3. Orphaned sessions: unbound, and their endpoint record is gone.
        inner.gc_sessions();

        outcome
    }

    /// Graceful shutdown: every live endpoint enters the grace substate so
    /// reconnecting clients find their state if the process comes back.
    pub fn mark_all_disconnected(&self, now: Instant) {
        let mut inner = self.lock();
        for record in inner.drivers.values_mut() {
            if record.connection.is_some() {
                record.mark_disconnected(now);
            }
        }
        for user in inner.users.values_mut() {
            if user.connection.is_some() {
                user.mark_disconnected(now);
            }
        }
        inner.account_conns.clear();
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn take_pending_restore(record: &mut DriverRecord) -> Option<DriverView> {
    if record.pending_state_restore {
        record.pending_state_restore = false;
        Some(DriverView::from_record(record))
    } else {
        None
    }
}

impl RegistryInner {
    /// Remove a connection's binding and its session record. Used when a
    /// registration or preemption replaces the session outright.
    fn drop_replaced_session(&mut self, conn: ConnectionId) {
        self.bindings.remove(&conn);
        if let Some(key) = self.conn_sessions.remove(&conn) {
            self.session_conns.remove(&key);
            self.sessions.remove(&key);
        }
    }

    /// Remove a connection's binding but keep the session record, for a
    /// resume that takes the session over from its incumbent.
    fn detach_conn(&mut self, conn: ConnectionId) {
        if let Some(binding) = self.bindings.remove(&conn) {
            if let Some(account) = &binding.account_id {
                if self.account_conns.get(account) == Some(&conn) {
                    self.account_conns.remove(account);
                }
            }
        }
        if let Some(key) = self.conn_sessions.remove(&conn) {
            self.session_conns.remove(&key);
        }
    }

    /// Enforce "at most one live connection per account": any incumbent
    /// other than `keep` loses its binding and session.
    fn preempt_account(&mut self, account: &str, keep: ConnectionId) -> Vec<ConnectionId> {
        match self.account_conns.get(account) {
            Some(&old) if old != keep => {
                self.drop_replaced_session(old);
                self.account_conns.remove(account);
                vec![old]
            }
            _ => Vec::new(),
        }
    }

    fn unbind_conn(&mut self, conn: ConnectionId, now: Instant) -> UnbindOutcome {
        let binding = self.bindings.remove(&conn);
        if let Some(key) = self.conn_sessions.remove(&conn) {
            self.session_conns.remove(&key);
        }

        let (role, account_id) = match binding {
            Some(b) => (Some(b.role), b.account_id),
            None => (None, None),
        };

        let mut ping_removals = Vec::new();
        if let Some(account) = &account_id {
            if self.account_conns.get(account) == Some(&conn) {
                self.account_conns.remove(account);
            }
            match role {
                Some(Role::Driver) => {
                    if let Some(record) = self.drivers.get_mut(account) {
                        if record.connection == Some(conn) {
                            record.mark_disconnected(now);
                        }
                    }
                }
                Some(Role::User) => {
                    if let Some(user) = self.users.get_mut(account) {
                        if user.connection == Some(conn) {
                            user.mark_disconnected(now);
                        }
                    }
                    ping_removals = self.prune_waiting(account);
                }
                None => {}
            }
        }

        UnbindOutcome {
            role,
            account_id,
            ping_removals,
        }
    }

    /// Late identity binding for driver connections, plus the mismatch
    /// check for connections that already declared one.
    fn bind_driver_identity(
        &mut self,
        conn: ConnectionId,
        account_id: &str,
    ) -> Result<Vec<ConnectionId>, RelayError> {
        let binding = self
            .bindings
            .get(&conn)
            .ok_or_else(|| RelayError::authorization("connection is not registered"))?;

        match &binding.account_id {
            Some(bound) if bound == account_id => Ok(Vec::new()),
            Some(bound) => Err(RelayError::validation(format!(
                "accountId {account_id} does not match this connection's identity {bound}"
            ))),
            None => {
                let preempted = self.preempt_account(account_id, conn);
                self.account_conns.insert(account_id.to_string(), conn);
                if let Some(binding) = self.bindings.get_mut(&conn) {
                    binding.account_id = Some(account_id.to_string());
                }
                if let Some(key) = self.conn_sessions.get(&conn).cloned() {
                    if let Some(session) = self.sessions.get_mut(&key) {
                        session.account_id = Some(account_id.to_string());
                    }
                }
                Ok(preempted)
            }
        }
    }

    /// Get-or-create the driver record for an authoritative update, and
    /// rebind it if the update arrived on a new connection. A stale handle
    /// left by a preempted connection is purged by the overwrite.
    fn driver_entry(&mut self, conn: ConnectionId, account_id: &str, now: Instant) -> &mut DriverRecord {
        let record = self
            .drivers
            .entry(account_id.to_string())
            .or_insert_with(|| DriverRecord::new(account_id.to_string(), conn, now));
        if record.connection != Some(conn) || record.disconnected {
            record.bind(conn);
        }
        record
    }

    fn user_account(&self, conn: ConnectionId) -> Result<String, RelayError> {
        match self.bindings.get(&conn) {
            Some(Binding {
                role: Role::User,
                account_id: Some(account),
            }) => Ok(account.clone()),
            Some(_) => Err(RelayError::authorization("user role required")),
            None => Err(RelayError::authorization("connection is not registered")),
        }
    }

    /// Remove `user_account` from every driver's waiting list, reporting
    /// the live drivers that should hear `pingRemoved`.
    fn prune_waiting(&mut self, user_account: &str) -> Vec<PingRemovalNotice> {
        let mut notices = Vec::new();
        for record in self.drivers.values_mut() {
            if record.waiting_passengers.remove(user_account).is_some() {
                if let Some(driver_conn) = record.connection {
                    notices.push(PingRemovalNotice {
                        driver_conn,
                        user_account_id: user_account.to_string(),
                    });
                }
            }
        }
        notices
    }

    /// Drop session records that are unbound and whose endpoint record no
    /// longer exists (reaped or ended).
    fn gc_sessions(&mut self) {
        let bound: std::collections::HashSet<&String> = self.session_conns.keys().collect();
        let keys: Vec<String> = self
            .sessions
            .iter()
            .filter(|(key, session)| {
                if bound.contains(key) {
                    return false;
                }
                match &session.account_id {
                    Some(account) => {
                        !self.drivers.contains_key(account) && !self.users.contains_key(account)
                    }
                    None => true,
                }
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            self.sessions.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const GRACE: Duration = Duration::from_secs(30);
    const STALE: Duration = Duration::from_secs(300);
    const THRESHOLD: f64 = 0.0001;
    const HEARTBEAT: Duration = Duration::from_secs(15);

    fn location(
        registry: &Registry,
        conn: ConnectionId,
        account: &str,
        lat: f64,
        lng: f64,
        at: Instant,
    ) -> UpdateOutcome {
        registry
            .apply_location(conn, account, lat, lng, &LocationPatch::default(), at, THRESHOLD, HEARTBEAT)
            .expect("location update")
    }

    fn register_driver(registry: &Registry, account: &str, now: Instant) -> ConnectionId {
        let conn = ConnectionId::mint();
        registry
            .register(conn, Role::Driver, Some(account.to_string()), now)
            .expect("driver registration");
        conn
    }

    fn register_user(registry: &Registry, account: &str, now: Instant) -> ConnectionId {
        let conn = ConnectionId::mint();
        registry
            .register(conn, Role::User, Some(account.to_string()), now)
            .expect("user registration");
        conn
    }

    #[test]
    fn user_registration_requires_account() {
        let registry = Registry::new();
        let err = registry
            .register(ConnectionId::mint(), Role::User, None, Instant::now())
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn driver_registration_may_defer_identity() {
        let registry = Registry::new();
        let now = Instant::now();
        let conn = ConnectionId::mint();
        registry.register(conn, Role::Driver, None, now).expect("anonymous driver");

        let outcome = location(&registry, conn, "D1", 14.5, 121.0, now);
        assert!(outcome.broadcast.is_some());
        assert_eq!(registry.bound_account(conn).as_deref(), Some("D1"));
    }

    #[test]
    fn second_registration_preempts_incumbent() {
        let registry = Registry::new();
        let now = Instant::now();
        let first = register_driver(&registry, "D1", now);
        let second = ConnectionId::mint();
        let outcome = registry
            .register(second, Role::Driver, Some("D1".to_string()), now)
            .expect("takeover");
        assert_eq!(outcome.preempted, vec![first]);
        // The incumbent's session is gone.
        assert!(registry.role_of(first).is_none());
    }

    #[test]
    fn preempting_with_no_incumbent_is_a_noop() {
        let registry = Registry::new();
        let now = Instant::now();
        let conn = register_driver(&registry, "D1", now);
        let outcome = location(&registry, conn, "D1", 14.5, 121.0, now);
        assert!(outcome.preempted.is_empty());
    }

    #[test]
    fn account_mismatch_is_rejected() {
        let registry = Registry::new();
        let now = Instant::now();
        let conn = register_driver(&registry, "D1", now);
        let err = registry
            .apply_location(conn, "D2", 14.5, 121.0, &LocationPatch::default(), now, THRESHOLD, HEARTBEAT)
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn resume_restores_role_and_defers_state_restore() {
        let registry = Registry::new();
        let t0 = Instant::now();
        let conn = register_driver(&registry, "D1", t0);
        let key = {
            let outcome = registry
                .register(conn, Role::Driver, Some("D1".to_string()), t0)
                .expect("re-register for key");
            outcome.session_key
        };
        location(&registry, conn, "D1", 14.5, 121.0, t0);

        registry.unbind(conn, t0 + Duration::from_secs(5));

        let newer = ConnectionId::mint();
        let resumed = registry
            .resume_session(newer, &key, t0 + Duration::from_secs(10))
            .expect("resume");
        assert_eq!(resumed.role, Role::Driver);
        assert_eq!(resumed.account_id.as_deref(), Some("D1"));

        // The restored view is deferred until the first authoritative update.
        let outcome = location(&registry, newer, "D1", 14.5, 121.0, t0 + Duration::from_secs(11));
        let restored = outcome.restored.expect("state restore released");
        assert_eq!(restored.account_id, "D1");
        // And only once.
        let again = location(&registry, newer, "D1", 14.6, 121.0, t0 + Duration::from_secs(12));
        assert!(again.restored.is_none());
    }

    #[test]
    fn resume_with_unknown_key_fails() {
        let registry = Registry::new();
        let err = registry
            .resume_session(ConnectionId::mint(), "no-such-key", Instant::now())
            .unwrap_err();
        assert_eq!(err.kind(), "session");
    }

    #[test]
    fn grace_reconnect_increments_attempts_and_survives() {
        let registry = Registry::new();
        let t0 = Instant::now();
        let conn = register_driver(&registry, "D1", t0);
        location(&registry, conn, "D1", 14.5, 121.0, t0);

        registry.unbind(conn, t0 + Duration::from_secs(5));

        let newer = ConnectionId::mint();
        registry
            .register(newer, Role::Driver, Some("D1".to_string()), t0 + Duration::from_secs(10))
            .expect("re-register");
        let outcome = location(&registry, newer, "D1", 14.5, 121.0, t0 + Duration::from_secs(10));
        // Comeback releases the deferred state restore.
        assert!(outcome.restored.is_some());

        let info = registry.bus_info("D1").expect("record kept");
        assert!(info.is_online);
    }

    #[test]
    fn end_session_removes_everything_at_once() {
        let registry = Registry::new();
        let now = Instant::now();
        let conn = register_driver(&registry, "D1", now);
        location(&registry, conn, "D1", 14.5, 121.0, now);

        let outcome = registry.end_session(conn).expect("end");
        assert_eq!(outcome.account_id, "D1");
        assert!(registry.bus_info("D1").is_none());
        assert!(registry.role_of(conn).is_none());

        // Reaping after a manual removal stays a no-op.
        let sweep = registry.sweep(now + STALE + Duration::from_secs(120), GRACE, STALE, |_| false);
        assert!(sweep.removed_drivers.is_empty());
    }

    #[test]
    fn sweep_reaps_stale_past_grace_only() {
        let registry = Registry::new();
        let t0 = Instant::now();
        let conn = register_driver(&registry, "D1", t0);
        location(&registry, conn, "D1", 14.5, 121.0, t0);
        registry.unbind(conn, t0);

        // Inside the stale window: retained.
        let sweep = registry.sweep(t0 + Duration::from_secs(60), GRACE, STALE, |_| false);
        assert!(sweep.removed_drivers.is_empty());

        // Stale and past grace: reaped.
        let sweep = registry.sweep(t0 + Duration::from_secs(301), GRACE, STALE, |_| false);
        assert_eq!(sweep.removed_drivers, vec!["D1".to_string()]);
        assert!(registry.bus_info("D1").is_none());
    }

    #[test]
    fn sweep_reconciles_dead_transports_into_grace() {
        let registry = Registry::new();
        let t0 = Instant::now();
        let conn = register_driver(&registry, "D1", t0);
        location(&registry, conn, "D1", 14.5, 121.0, t0);

        // Transport gone, no unbind ever delivered.
        let sweep = registry.sweep(t0 + Duration::from_secs(1), GRACE, STALE, |_| false);
        assert!(sweep.removed_drivers.is_empty());
        let info = registry.bus_info("D1").expect("record kept in grace");
        assert!(!info.is_online);
        assert!(registry.role_of(conn).is_none());
    }

    #[test]
    fn ping_routes_to_the_one_driver_and_stores_the_wait() {
        let registry = Registry::new();
        let now = Instant::now();
        let driver_conn = register_driver(&registry, "D1", now);
        location(&registry, driver_conn, "D1", 14.5, 121.0, now);
        let user_conn = register_user(&registry, "U1", now);

        let outcome = registry
            .ping_driver(user_conn, "D1", 14.5, 121.0, 2, 0, now, |_| true)
            .expect("ping");
        assert_eq!(outcome.driver_conn, driver_conn);
        assert_eq!(outcome.user_account_id, "U1");

        // User disconnect prunes the wait and reports the driver to notify.
        let unbound = registry.unbind(user_conn, now);
        assert_eq!(
            unbound.ping_removals,
            vec![PingRemovalNotice {
                driver_conn,
                user_account_id: "U1".to_string()
            }]
        );
        // Second unbind finds nothing left to prune.
        let again = registry.unbind(user_conn, now);
        assert!(again.ping_removals.is_empty());
    }

    #[test]
    fn ping_to_unknown_or_offline_driver_fails_clean() {
        let registry = Registry::new();
        let now = Instant::now();
        let user_conn = register_user(&registry, "U1", now);

        let err = registry
            .ping_driver(user_conn, "ghost", 14.5, 121.0, 1, 0, now, |_| true)
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");

        let driver_conn = register_driver(&registry, "D1", now);
        location(&registry, driver_conn, "D1", 14.5, 121.0, now);
        registry.unbind(driver_conn, now);
        let err = registry
            .ping_driver(user_conn, "D1", 14.5, 121.0, 1, 0, now, |_| true)
            .unwrap_err();
        assert_eq!(err.kind(), "unavailable");
    }

    #[test]
    fn unping_reports_driver_connection() {
        let registry = Registry::new();
        let now = Instant::now();
        let driver_conn = register_driver(&registry, "D1", now);
        location(&registry, driver_conn, "D1", 14.5, 121.0, now);
        let user_conn = register_user(&registry, "U1", now);
        registry
            .ping_driver(user_conn, "D1", 14.5, 121.0, 1, 0, now, |_| true)
            .expect("ping");

        let outcome = registry.unping_driver(user_conn, "D1").expect("unping");
        assert_eq!(outcome.driver_conn, Some(driver_conn));
        // Idempotent on the entry.
        assert!(registry.unping_driver(user_conn, "D1").is_ok());
    }

    #[test]
    fn replayed_passenger_update_broadcasts_once() {
        let registry = Registry::new();
        let now = Instant::now();
        let conn = register_driver(&registry, "D1", now);
        location(&registry, conn, "D1", 14.5, 121.0, now);

        let first = registry
            .apply_passengers(conn, "D1", Some(5), Some(20), now)
            .expect("first");
        assert!(first.broadcast.is_some());
        let replay = registry
            .apply_passengers(conn, "D1", Some(5), Some(20), now)
            .expect("replay");
        assert!(replay.broadcast.is_none());
    }

    #[test]
    fn replayed_route_update_broadcasts_once() {
        let registry = Registry::new();
        let now = Instant::now();
        let conn = register_driver(&registry, "D1", now);
        let geometry = serde_json::json!({"polyline": "abc"});

        let first = registry
            .apply_route(conn, "D1", geometry.clone(), None, None, now)
            .expect("first");
        assert!(first.broadcast.is_some());
        let replay = registry
            .apply_route(conn, "D1", geometry, None, None, now)
            .expect("replay");
        assert!(replay.broadcast.is_none());
    }

    #[test]
    fn destination_update_always_broadcasts() {
        let registry = Registry::new();
        let now = Instant::now();
        let conn = register_driver(&registry, "D1", now);
        let patch = LocationPatch {
            destination_name: Some("Terminal A".to_string()),
            destination_lat: Some(14.6),
            destination_lng: Some(121.1),
            ..Default::default()
        };
        for _ in 0..2 {
            let outcome = registry
                .apply_destination(conn, "D1", &patch, now)
                .expect("destination");
            assert!(outcome.broadcast.is_some());
        }
    }

    #[test]
    fn at_most_one_live_connection_per_account() {
        let registry = Registry::new();
        let now = Instant::now();
        let first = register_driver(&registry, "D1", now);
        let second = ConnectionId::mint();
        registry
            .register(second, Role::Driver, Some("D1".to_string()), now)
            .expect("takeover");

        let inner = registry.lock();
        assert_eq!(inner.account_conns.get("D1"), Some(&second));
        assert!(!inner.bindings.contains_key(&first));
        // Session key index agrees with the session table bindings.
        for (key, conn) in inner.session_conns.iter() {
            assert!(inner.sessions.contains_key(key));
            assert_eq!(inner.conn_sessions.get(conn), Some(key));
        }
    }

    #[test]
    fn shutdown_marks_everyone_disconnected() {
        let registry = Registry::new();
        let now = Instant::now();
        let conn = register_driver(&registry, "D1", now);
        location(&registry, conn, "D1", 14.5, 121.0, now);
        register_user(&registry, "U1", now);

        registry.mark_all_disconnected(now);
        assert!(!registry.bus_info("D1").expect("record kept").is_online);
    }
}
