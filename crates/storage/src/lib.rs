//! In-process implementation of the remote store contract: JSON-row tables with
//! unique constraints, realtime insert fan-out and presence hubs.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use gateway::{
    GatewayResult, PresenceChannel, PresenceEvent, PresenceSnapshot, RemoteStore, Subscription,
};
use serde_json::{Map, Value};
use shared::{
    error::GatewayError,
    protocol::Table,
    query::{compare_values, Direction, Filter, Query},
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

const SUBSCRIPTION_BUFFER: usize = 1024;
const PRESENCE_EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Query,
    Insert,
    Upsert,
    Update,
    Delete,
    Subscribe,
}

#[derive(Debug, Clone)]
struct Fault {
    error: GatewayError,
    once: bool,
}

struct Subscriber {
    table: Table,
    filter: Filter,
    tx: mpsc::Sender<Value>,
}

#[derive(Default)]
struct StoreInner {
    tables: Mutex<HashMap<Table, Vec<Value>>>,
    subscribers: Mutex<Vec<Subscriber>>,
    presence: Mutex<HashMap<String, Arc<PresenceHub>>>,
    faults: Mutex<HashMap<(Table, Operation), Fault>>,
    latency: Mutex<HashMap<(Table, Operation), Duration>>,
    duplicate_delivery: AtomicBool,
    next_handle: AtomicU64,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn unique_columns(table: Table) -> &'static [&'static str] {
    match table {
        Table::MessageReactions => &["message_id", "user_id", "emoji"],
        Table::OnlineMembers => &["user_id"],
        Table::Messages | Table::Channels | Table::Users | Table::GlobalAlerts => &["id"],
    }
}

fn assigns_id(table: Table) -> bool {
    matches!(
        table,
        Table::Messages | Table::Channels | Table::Users | Table::GlobalAlerts
    )
}

fn timestamp_default(table: Table) -> Option<&'static str> {
    match table {
        Table::Messages => Some("sent_at"),
        Table::GlobalAlerts => Some("created_at"),
        _ => None,
    }
}

fn same_key(columns: &[&str], a: &Value, b: &Value) -> bool {
    columns.iter().all(|column| {
        let left = a.get(*column).filter(|v| !v.is_null());
        let right = b.get(*column).filter(|v| !v.is_null());
        left.is_some() && left == right
    })
}

fn into_object(table: Table, record: Value) -> GatewayResult<Map<String, Value>> {
    match record {
        Value::Object(map) => Ok(map),
        other => Err(GatewayError::validation(format!(
            "{table}: expected an object record, got {other}"
        ))),
    }
}

fn merge_patch(row: &mut Value, patch: &Map<String, Value>) {
    if let Value::Object(target) = row {
        for (column, value) in patch {
            target.insert(column.clone(), value.clone());
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes rows directly, bypassing constraints, faults and realtime fan-out.
    pub fn seed(&self, table: Table, rows: impl IntoIterator<Item = Value>) {
        lock(&self.inner.tables)
            .entry(table)
            .or_default()
            .extend(rows);
    }

    pub fn rows(&self, table: Table) -> Vec<Value> {
        lock(&self.inner.tables)
            .get(&table)
            .cloned()
            .unwrap_or_default()
    }

    /// Fails every `operation` on `table` with `error` until [`MemoryStore::clear_faults`].
    pub fn inject_fault(&self, table: Table, operation: Operation, error: GatewayError) {
        lock(&self.inner.faults).insert((table, operation), Fault { error, once: false });
    }

    pub fn inject_fault_once(&self, table: Table, operation: Operation, error: GatewayError) {
        lock(&self.inner.faults).insert((table, operation), Fault { error, once: true });
    }

    /// Delays every `operation` on `table` by `delay` before it runs.
    pub fn set_latency(&self, table: Table, operation: Operation, delay: Duration) {
        lock(&self.inner.latency).insert((table, operation), delay);
    }

    pub fn clear_faults(&self) {
        lock(&self.inner.faults).clear();
        lock(&self.inner.latency).clear();
    }

    /// Deliver every realtime insert twice, as an at-least-once transport may.
    pub fn set_duplicate_delivery(&self, enabled: bool) {
        self.inner
            .duplicate_delivery
            .store(enabled, Ordering::SeqCst);
    }

    pub fn active_subscriptions(&self) -> usize {
        let mut subscribers = lock(&self.inner.subscribers);
        subscribers.retain(|s| !s.tx.is_closed());
        subscribers.len()
    }

    /// Delays broadcasts on presence `topic` by `delay`, joined or not.
    pub fn set_broadcast_latency(&self, topic: &str, delay: Duration) {
        let hub = Arc::clone(
            lock(&self.inner.presence)
                .entry(topic.to_string())
                .or_insert_with(|| Arc::new(PresenceHub::new(topic))),
        );
        *lock(&hub.broadcast_delay) = Some(delay);
    }

    /// Removes every member tracked under `presence_key` without a leave, like a dropped socket.
    pub fn drop_presence_member(&self, topic: &str, presence_key: &str) {
        let hub = lock(&self.inner.presence).get(topic).cloned();
        if let Some(hub) = hub {
            lock(&hub.members).retain(|_, member| member.key != presence_key);
            hub.notify(PresenceEvent::Sync);
        }
    }

    async fn check(&self, table: Table, operation: Operation) -> GatewayResult<()> {
        let delay = lock(&self.inner.latency).get(&(table, operation)).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check_fault(table, operation)
    }

    fn check_fault(&self, table: Table, operation: Operation) -> GatewayResult<()> {
        let mut faults = lock(&self.inner.faults);
        let Some(fault) = faults.get(&(table, operation)).cloned() else {
            return Ok(());
        };
        if fault.once {
            faults.remove(&(table, operation));
        }
        debug!(%table, ?operation, error = %fault.error, "memory store: injected fault");
        Err(fault.error)
    }

    fn fan_out(&self, table: Table, row: &Value) {
        let copies = if self.inner.duplicate_delivery.load(Ordering::SeqCst) {
            2
        } else {
            1
        };
        let mut subscribers = lock(&self.inner.subscribers);
        subscribers.retain(|subscriber| {
            if subscriber.tx.is_closed() {
                return false;
            }
            if subscriber.table != table || !subscriber.filter.matches(row) {
                return true;
            }
            for _ in 0..copies {
                match subscriber.tx.try_send(row.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(%table, "memory store: subscriber buffer full, dropping event");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => return false,
                }
            }
            true
        });
    }

    fn insert_row(&self, table: Table, record: Value) -> GatewayResult<Value> {
        let mut row = into_object(table, record)?;
        if assigns_id(table) && row.get("id").map_or(true, Value::is_null) {
            row.insert(
                "id".to_string(),
                Value::String(uuid::Uuid::new_v4().to_string()),
            );
        }
        if let Some(column) = timestamp_default(table) {
            if row.get(column).map_or(true, Value::is_null) {
                row.insert(
                    column.to_string(),
                    Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
                );
            }
        }
        let row = Value::Object(row);

        {
            let mut tables = lock(&self.inner.tables);
            let rows = tables.entry(table).or_default();
            let columns = unique_columns(table);
            if rows.iter().any(|existing| same_key(columns, existing, &row)) {
                return Err(GatewayError::conflict(format!(
                    "duplicate key value violates unique constraint on {table} ({})",
                    columns.join(", ")
                )));
            }
            rows.push(row.clone());
        }

        self.fan_out(table, &row);
        Ok(row)
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn query(&self, query: Query) -> GatewayResult<Vec<Value>> {
        self.check(query.table, Operation::Query).await?;
        let mut rows: Vec<Value> = lock(&self.inner.tables)
            .get(&query.table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| query.filter.matches(row))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Some(order) = &query.order {
            rows.sort_by(|a, b| {
                let ordering = compare_values(a.get(&order.column), b.get(&order.column));
                match order.direction {
                    Direction::Ascending => ordering,
                    Direction::Descending => ordering.reverse(),
                }
            });
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn insert(&self, table: Table, record: Value) -> GatewayResult<Value> {
        self.check(table, Operation::Insert).await?;
        self.insert_row(table, record)
    }

    async fn upsert(
        &self,
        table: Table,
        record: Value,
        conflict_columns: &[&str],
    ) -> GatewayResult<Value> {
        self.check(table, Operation::Upsert).await?;
        let patch = into_object(table, record)?;
        let candidate = Value::Object(patch.clone());
        {
            let mut tables = lock(&self.inner.tables);
            let rows = tables.entry(table).or_default();
            if let Some(existing) = rows
                .iter_mut()
                .find(|row| same_key(conflict_columns, row, &candidate))
            {
                merge_patch(existing, &patch);
                return Ok(existing.clone());
            }
        }
        self.insert_row(table, candidate)
    }

    async fn update(&self, table: Table, patch: Value, filter: Filter) -> GatewayResult<usize> {
        self.check(table, Operation::Update).await?;
        let patch = into_object(table, patch)?;
        let mut tables = lock(&self.inner.tables);
        let mut updated = 0;
        for row in tables.entry(table).or_default().iter_mut() {
            if filter.matches(row) {
                merge_patch(row, &patch);
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn delete(&self, table: Table, filter: Filter) -> GatewayResult<usize> {
        self.check(table, Operation::Delete).await?;
        let mut tables = lock(&self.inner.tables);
        let rows = tables.entry(table).or_default();
        let before = rows.len();
        rows.retain(|row| !filter.matches(row));
        Ok(before - rows.len())
    }

    async fn subscribe(&self, table: Table, filter: Filter) -> GatewayResult<Subscription> {
        self.check(table, Operation::Subscribe).await?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        lock(&self.inner.subscribers).push(Subscriber {
            table,
            filter: filter.clone(),
            tx,
        });
        Ok(Subscription::new(table, filter, rx))
    }

    async fn join_presence(
        &self,
        topic: &str,
        presence_key: &str,
    ) -> GatewayResult<Arc<dyn PresenceChannel>> {
        let hub = Arc::clone(
            lock(&self.inner.presence)
                .entry(topic.to_string())
                .or_insert_with(|| Arc::new(PresenceHub::new(topic))),
        );
        let handle_id = self.inner.next_handle.fetch_add(1, Ordering::SeqCst);
        lock(&hub.members).insert(
            handle_id,
            Member {
                key: presence_key.to_string(),
                meta: None,
            },
        );
        Ok(Arc::new(MemoryPresenceChannel {
            hub,
            handle_id,
            left: AtomicBool::new(false),
        }))
    }
}

struct Member {
    key: String,
    meta: Option<Value>,
}

struct PresenceHub {
    topic: String,
    members: Mutex<HashMap<u64, Member>>,
    events: broadcast::Sender<PresenceEvent>,
    broadcast_delay: Mutex<Option<Duration>>,
}

impl PresenceHub {
    fn new(topic: &str) -> Self {
        let (events, _) = broadcast::channel(PRESENCE_EVENT_BUFFER);
        Self {
            topic: topic.to_string(),
            members: Mutex::new(HashMap::new()),
            events,
            broadcast_delay: Mutex::new(None),
        }
    }

    fn notify(&self, event: PresenceEvent) {
        // No receivers is fine: nobody is listening on this topic yet.
        let _ = self.events.send(event);
    }
}

pub struct MemoryPresenceChannel {
    hub: Arc<PresenceHub>,
    handle_id: u64,
    left: AtomicBool,
}

impl MemoryPresenceChannel {
    fn ensure_joined(&self) -> GatewayResult<()> {
        if self.left.load(Ordering::SeqCst) {
            return Err(GatewayError::transport(format!(
                "presence channel {} already left",
                self.hub.topic
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl PresenceChannel for MemoryPresenceChannel {
    fn topic(&self) -> &str {
        &self.hub.topic
    }

    async fn track(&self, meta: Value) -> GatewayResult<()> {
        self.ensure_joined()?;
        if let Some(member) = lock(&self.hub.members).get_mut(&self.handle_id) {
            member.meta = Some(meta);
        }
        self.hub.notify(PresenceEvent::Sync);
        Ok(())
    }

    async fn untrack(&self) -> GatewayResult<()> {
        self.ensure_joined()?;
        if let Some(member) = lock(&self.hub.members).get_mut(&self.handle_id) {
            member.meta = None;
        }
        self.hub.notify(PresenceEvent::Sync);
        Ok(())
    }

    fn snapshot(&self) -> PresenceSnapshot {
        let mut snapshot = PresenceSnapshot::new();
        for member in lock(&self.hub.members).values() {
            if let Some(meta) = &member.meta {
                snapshot
                    .entry(member.key.clone())
                    .or_default()
                    .push(meta.clone());
            }
        }
        snapshot
    }

    async fn broadcast(&self, event: &str, payload: Value) -> GatewayResult<()> {
        self.ensure_joined()?;
        let delay = *lock(&self.hub.broadcast_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.hub.notify(PresenceEvent::Broadcast {
            event: event.to_string(),
            payload,
        });
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<PresenceEvent> {
        self.hub.events.subscribe()
    }

    async fn leave(&self) -> GatewayResult<()> {
        if self.left.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let removed = lock(&self.hub.members).remove(&self.handle_id);
        if removed.is_some_and(|member| member.meta.is_some()) {
            self.hub.notify(PresenceEvent::Sync);
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
