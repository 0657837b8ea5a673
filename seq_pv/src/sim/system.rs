//! Simulated PV system and variables.

use super::SIM_SYSTEM_NAME;
use super::record::{Record, SimConfig};
use parking_lot::Mutex;
use seq_common::pv::{
    CompletionHandler, ConnectionHandler, MonitorHandler, MonitorId, PvConnection, PvError,
    PvEvent, PvSeverity, PvStatus, PvSystem, PvType, PvValue, PvVariable,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

struct Monitor {
    id: MonitorId,
    ty: PvType,
    count: usize,
    handler: MonitorHandler,
}

struct VarEntry {
    pv_name: String,
    on_connection: ConnectionHandler,
    monitors: Vec<Monitor>,
}

#[derive(Default)]
struct SimState {
    records: HashMap<String, Record>,
    variables: HashMap<u64, VarEntry>,
    hold: bool,
    held: Vec<(CompletionHandler, PvEvent)>,
}

type Delivery = (MonitorHandler, PvEvent);

impl SimState {
    fn connected_record(&self, pv_name: &str) -> Result<&Record, PvError> {
        self.records
            .get(pv_name)
            .filter(|r| r.connected)
            .ok_or_else(|| PvError::Disconnected(pv_name.to_string()))
    }

    /// Current value for every subscription on `pv_name`.
    fn monitor_deliveries(&self, pv_name: &str) -> Vec<Delivery> {
        let Some(record) = self.records.get(pv_name).filter(|r| r.connected) else {
            return Vec::new();
        };
        self.variables
            .values()
            .filter(|v| v.pv_name == pv_name)
            .flat_map(|v| v.monitors.iter())
            .map(|m| (Arc::clone(&m.handler), event(record, m.ty, m.count)))
            .collect()
    }

    fn connection_handlers(&self, pv_name: &str) -> Vec<ConnectionHandler> {
        self.variables
            .values()
            .filter(|v| v.pv_name == pv_name)
            .map(|v| Arc::clone(&v.on_connection))
            .collect()
    }
}

fn event(record: &Record, ty: PvType, count: usize) -> PvEvent {
    PvEvent {
        value: Some(record.read(ty, count)),
        status: PvStatus::Ok,
        alarm: record.meta.status,
        severity: record.meta.severity,
        timestamp: record.meta.timestamp,
    }
}

fn deliver(deliveries: Vec<Delivery>) {
    for (handler, event) in deliveries {
        handler(event);
    }
}

struct Inner {
    state: Mutex<SimState>,
    next_id: AtomicU64,
}

impl Inner {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// In-memory PV system. Clones share the same records.
#[derive(Clone)]
pub struct SimPvSystem {
    inner: Arc<Inner>,
}

impl SimPvSystem {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SimState::default()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Simulator seeded with the configured records.
    pub fn from_config(config: &SimConfig) -> Self {
        let sim = Self::new();
        for rec in &config.records {
            sim.add_record_with(&rec.name, rec.value.clone(), rec.connected);
        }
        sim
    }

    /// Create (or replace) a connected record.
    pub fn add_record(&self, name: &str, value: PvValue) {
        self.add_record_with(name, value, true);
    }

    /// Create (or replace) a record. Variables already waiting for `name`
    /// connect if `connected` is set.
    pub fn add_record_with(&self, name: &str, value: PvValue, connected: bool) {
        let count = value.len();
        let handlers = {
            let mut state = self.inner.state.lock();
            state
                .records
                .insert(name.to_string(), Record::new(value, connected));
            if connected {
                state.connection_handlers(name)
            } else {
                Vec::new()
            }
        };
        debug!(pv = name, connected, "sim record added");
        for handler in handlers {
            handler(PvConnection {
                connected: true,
                element_count: count,
            });
        }
    }

    /// Write `value` to record `name` and post monitors. False if there is
    /// no such record.
    pub fn set(&self, name: &str, value: PvValue) -> bool {
        let deliveries = {
            let mut state = self.inner.state.lock();
            let Some(record) = state.records.get_mut(name) else {
                return false;
            };
            let count = value.len();
            record.write(&value, count);
            state.monitor_deliveries(name)
        };
        trace!(pv = name, "sim record set");
        deliver(deliveries);
        true
    }

    pub fn value(&self, name: &str) -> Option<PvValue> {
        self.inner
            .state
            .lock()
            .records
            .get(name)
            .map(|r| r.value.clone())
    }

    /// Raise (or clear, with `Ok`/`None`) an alarm on record `name` and
    /// post monitors.
    pub fn set_alarm(
        &self,
        name: &str,
        status: PvStatus,
        severity: PvSeverity,
        message: Option<&str>,
    ) -> bool {
        let deliveries = {
            let mut state = self.inner.state.lock();
            let Some(record) = state.records.get_mut(name) else {
                return false;
            };
            record.set_alarm(status, severity, message.map(str::to_string));
            state.monitor_deliveries(name)
        };
        deliver(deliveries);
        true
    }

    /// Disconnect record `name`. Subscriptions stay registered.
    pub fn disconnect(&self, name: &str) -> bool {
        self.set_connected(name, false)
    }

    /// Reconnect record `name`. Subscriptions receive the next update.
    pub fn reconnect(&self, name: &str) -> bool {
        self.set_connected(name, true)
    }

    fn set_connected(&self, name: &str, connected: bool) -> bool {
        let (handlers, count) = {
            let mut state = self.inner.state.lock();
            let Some(record) = state.records.get_mut(name) else {
                return false;
            };
            if record.connected == connected {
                return true;
            }
            record.connected = connected;
            let count = record.value.len();
            (state.connection_handlers(name), count)
        };
        debug!(pv = name, connected, "sim connection change");
        for handler in handlers {
            handler(PvConnection {
                connected,
                element_count: if connected { count } else { 0 },
            });
        }
        true
    }

    /// While set, get/put completions are queued instead of delivered.
    pub fn hold_completions(&self, hold: bool) {
        self.inner.state.lock().hold = hold;
    }

    /// Deliver all held completions. Returns how many were delivered.
    pub fn release_completions(&self) -> usize {
        let held = std::mem::take(&mut self.inner.state.lock().held);
        let n = held.len();
        for (handler, event) in held {
            handler(event);
        }
        n
    }

    pub fn pending_completions(&self) -> usize {
        self.inner.state.lock().held.len()
    }

    /// Number of puts record `name` has received.
    pub fn put_count(&self, name: &str) -> u64 {
        self.inner
            .state
            .lock()
            .records
            .get(name)
            .map_or(0, |r| r.puts)
    }

    /// Live (not destroyed) variables.
    pub fn variable_count(&self) -> usize {
        self.inner.state.lock().variables.len()
    }

    /// Active subscriptions on record `name`.
    pub fn monitor_count(&self, name: &str) -> usize {
        self.inner
            .state
            .lock()
            .variables
            .values()
            .filter(|v| v.pv_name == name)
            .map(|v| v.monitors.len())
            .sum()
    }

    fn complete(&self, handler: CompletionHandler, event: PvEvent) {
        let mut state = self.inner.state.lock();
        if state.hold {
            state.held.push((handler, event));
            return;
        }
        drop(state);
        handler(event);
    }
}

impl Default for SimPvSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl PvSystem for SimPvSystem {
    fn name(&self) -> &'static str {
        SIM_SYSTEM_NAME
    }

    fn create(
        &self,
        pv_name: &str,
        on_connection: ConnectionHandler,
    ) -> Result<Arc<dyn PvVariable>, PvError> {
        let id = self.inner.next_id();
        let count = {
            let mut state = self.inner.state.lock();
            state.variables.insert(
                id,
                VarEntry {
                    pv_name: pv_name.to_string(),
                    on_connection: Arc::clone(&on_connection),
                    monitors: Vec::new(),
                },
            );
            state.connected_record(pv_name).ok().map(|r| r.value.len())
        };
        debug!(pv = pv_name, id, "sim variable created");
        if let Some(element_count) = count {
            on_connection(PvConnection {
                connected: true,
                element_count,
            });
        }
        Ok(Arc::new(SimVariable {
            id,
            name: pv_name.to_string(),
            system: self.clone(),
        }))
    }
}

/// One variable of a [`SimPvSystem`].
pub struct SimVariable {
    id: u64,
    name: String,
    system: SimPvSystem,
}

impl SimVariable {
    fn write(&self, value: &PvValue, count: usize) -> Result<Vec<Delivery>, PvError> {
        let mut state = self.system.inner.state.lock();
        if !state.variables.contains_key(&self.id) {
            return Err(PvError::Backend(format!("{}: variable destroyed", self.name)));
        }
        let record = state
            .records
            .get_mut(&self.name)
            .filter(|r| r.connected)
            .ok_or_else(|| PvError::Disconnected(self.name.clone()))?;
        record.write(value, count);
        record.puts += 1;
        Ok(state.monitor_deliveries(&self.name))
    }
}

impl PvVariable for SimVariable {
    fn name(&self) -> &str {
        &self.name
    }

    fn element_count(&self) -> usize {
        self.system
            .inner
            .state
            .lock()
            .connected_record(&self.name)
            .map_or(0, |r| r.value.len())
    }

    fn get_callback(
        &self,
        ty: PvType,
        count: usize,
        handler: CompletionHandler,
    ) -> Result<(), PvError> {
        let event = {
            let state = self.system.inner.state.lock();
            event(state.connected_record(&self.name)?, ty, count)
        };
        self.system.complete(handler, event);
        Ok(())
    }

    fn put_callback(
        &self,
        value: &PvValue,
        count: usize,
        handler: CompletionHandler,
    ) -> Result<(), PvError> {
        let deliveries = self.write(value, count)?;
        deliver(deliveries);
        self.system
            .complete(handler, PvEvent::completion(PvStatus::Ok));
        Ok(())
    }

    fn put_no_block(&self, value: &PvValue, count: usize) -> Result<(), PvError> {
        let deliveries = self.write(value, count)?;
        deliver(deliveries);
        Ok(())
    }

    fn monitor_on(
        &self,
        ty: PvType,
        count: usize,
        handler: MonitorHandler,
    ) -> Result<MonitorId, PvError> {
        let id = MonitorId(self.system.inner.next_id());
        let initial = {
            let mut state = self.system.inner.state.lock();
            let initial = state
                .connected_record(&self.name)
                .ok()
                .map(|r| event(r, ty, count));
            let entry = state
                .variables
                .get_mut(&self.id)
                .ok_or_else(|| PvError::Backend(format!("{}: variable destroyed", self.name)))?;
            entry.monitors.push(Monitor {
                id,
                ty,
                count,
                handler: Arc::clone(&handler),
            });
            initial
        };
        if let Some(event) = initial {
            handler(event);
        }
        Ok(id)
    }

    fn monitor_off(&self, id: MonitorId) -> Result<(), PvError> {
        let mut state = self.system.inner.state.lock();
        if let Some(entry) = state.variables.get_mut(&self.id) {
            entry.monitors.retain(|m| m.id != id);
        }
        Ok(())
    }

    fn message(&self) -> Option<String> {
        self.system
            .inner
            .state
            .lock()
            .records
            .get(&self.name)
            .and_then(|r| r.meta.message.clone())
    }

    fn destroy(&self) -> Result<(), PvError> {
        self.system.inner.state.lock().variables.remove(&self.id);
        debug!(pv = %self.name, id = self.id, "sim variable destroyed");
        Ok(())
    }
}
