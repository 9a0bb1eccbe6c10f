use crate::error::QuestError;
use crate::model::{real_to_json, Level, Row, TableDef};
use parking_lot::Mutex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

pub const DEFAULT_SANDBOX_TTL: Duration = Duration::from_secs(60 * 60);

/// Progress handler callback interval, in SQLite virtual-machine ops.
const PROGRESS_HANDLER_OPS: i32 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SandboxKey {
    pub session_id: String,
    pub level_id: u32,
}

impl SandboxKey {
    pub fn new(session_id: &str, level_id: u32) -> Self {
        Self {
            session_id: session_id.to_string(),
            level_id,
        }
    }
}

impl fmt::Display for SandboxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.session_id, self.level_id)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SandboxSettings {
    /// Lifetime of an instance, counted from creation. Use does not extend it.
    pub ttl: Duration,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_SANDBOX_TTL,
        }
    }
}

/// An isolated in-memory database seeded with one level's tables.
pub struct Sandbox {
    id: u64,
    key: SandboxKey,
    conn: Mutex<Connection>,
}

impl Sandbox {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &SandboxKey {
        &self.key
    }

    /// Runs one statement and returns every row it yields.
    ///
    /// With a `timeout`, SQLite interrupts the statement once the deadline
    /// passes and the call fails with `OperationInterrupted`.
    pub fn query(&self, sql: &str, timeout: Option<Duration>) -> Result<Vec<Row>, rusqlite::Error> {
        let conn = self.conn.lock();
        if let Some(limit) = timeout {
            let deadline = Instant::now() + limit;
            conn.progress_handler(PROGRESS_HANDLER_OPS, Some(move || Instant::now() > deadline))?;
        }
        let out = read_rows(&conn, sql);
        if timeout.is_some() {
            conn.progress_handler(0, None::<fn() -> bool>)?;
        }
        out
    }
}

fn read_rows(conn: &Connection, sql: &str) -> Result<Vec<Row>, rusqlite::Error> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = (0..stmt.column_count())
        .map(|i| stmt.column_name(i).map(str::to_string))
        .collect::<Result<_, _>>()?;

    let mut out = Vec::new();
    let mut rows = stmt.raw_query();
    while let Some(row) = rows.next()? {
        let mut record = Row::with_capacity(columns.len());
        for (i, name) in columns.iter().enumerate() {
            record.insert(name.clone(), sqlite_value_to_json(row.get_ref(i)?));
        }
        out.push(record);
    }
    Ok(out)
}

fn sqlite_value_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Number(i.into()),
        ValueRef::Real(f) => real_to_json(f),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(_) => Value::Null,
    }
}

pub fn is_interrupt_error(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ErrorCode::OperationInterrupted,
                ..
            },
            _
        )
    )
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map(SqlValue::Real).unwrap_or(SqlValue::Null),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        // Rejected when the catalog is loaded.
        Value::Array(_) | Value::Object(_) => SqlValue::Null,
    }
}

fn create_table(conn: &Connection, table: &TableDef) -> Result<(), rusqlite::Error> {
    let columns = table
        .schema
        .iter()
        .map(|(name, ty)| format!("{} {}", quote_ident(name), ty.trim()))
        .collect::<Vec<_>>()
        .join(", ");
    conn.execute_batch(&format!("CREATE TABLE {} ({columns})", quote_ident(&table.name)))?;

    if table.data.is_empty() {
        return Ok(());
    }

    let names = table
        .schema
        .keys()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = vec!["?"; table.schema.len()].join(", ");
    let mut insert = conn.prepare(&format!(
        "INSERT INTO {} ({names}) VALUES ({placeholders})",
        quote_ident(&table.name)
    ))?;
    for row in &table.data {
        let values = table
            .schema
            .keys()
            .map(|c| row.get(c).map(json_to_sql).unwrap_or(SqlValue::Null));
        insert.execute(params_from_iter(values))?;
    }
    Ok(())
}

fn seed(level: &Level) -> Result<Connection, rusqlite::Error> {
    let mut conn = Connection::open_in_memory()?;
    let tx = conn.transaction()?;
    for table in &level.tables {
        create_table(&tx, table)?;
    }
    tx.commit()?;
    Ok(conn)
}

#[derive(Default)]
struct Slot {
    /// Held for the whole provisioning step so one key is seeded at most once.
    sandbox: Mutex<Option<Arc<Sandbox>>>,
    /// Id of the live instance, 0 while empty. Read by expiry without the slot lock.
    live_id: AtomicU64,
    expiry: Mutex<Option<AbortHandle>>,
}

struct PoolInner {
    settings: SandboxSettings,
    runtime: Handle,
    slots: Mutex<HashMap<SandboxKey, Arc<Slot>>>,
    next_id: AtomicU64,
}

impl PoolInner {
    fn is_registered(&self, key: &SandboxKey, slot: &Arc<Slot>) -> bool {
        self.slots
            .lock()
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    fn unregister(&self, key: &SandboxKey, slot: &Arc<Slot>) {
        let mut slots = self.slots.lock();
        if slots.get(key).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            slots.remove(key);
        }
    }

    fn expire(&self, key: &SandboxKey, sandbox_id: u64) {
        let mut slots = self.slots.lock();
        let live = slots
            .get(key)
            .is_some_and(|slot| slot.live_id.load(Ordering::Acquire) == sandbox_id);
        if live {
            slots.remove(key);
            info!(%key, sandbox_id, "sandbox expired");
        } else {
            debug!(%key, sandbox_id, "stale expiry ignored");
        }
    }
}

/// Registry of live sandboxes, one per `(session, level)`.
#[derive(Clone)]
pub struct SandboxPool {
    inner: Arc<PoolInner>,
}

impl SandboxPool {
    /// Expiry tasks are spawned on `runtime`.
    pub fn new(settings: SandboxSettings, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                settings,
                runtime,
                slots: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn acquire(&self, session_id: &str, level: &Level) -> Result<Arc<Sandbox>, QuestError> {
        let key = SandboxKey::new(session_id, level.id);
        loop {
            let slot = {
                let mut slots = self.inner.slots.lock();
                Arc::clone(slots.entry(key.clone()).or_default())
            };

            let mut guard = slot.sandbox.lock();
            if let Some(existing) = guard.as_ref() {
                return Ok(Arc::clone(existing));
            }
            // Evicted while we waited on the slot; start over with a fresh one.
            if !self.inner.is_registered(&key, &slot) {
                continue;
            }

            let conn = match seed(level) {
                Ok(conn) => conn,
                Err(source) => {
                    drop(guard);
                    self.inner.unregister(&key, &slot);
                    warn!(%key, error = %source, "sandbox setup failed");
                    return Err(QuestError::Setup {
                        key: key.to_string(),
                        source,
                    });
                }
            };

            let sandbox = Arc::new(Sandbox {
                id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
                key: key.clone(),
                conn: Mutex::new(conn),
            });
            slot.live_id.store(sandbox.id, Ordering::Release);
            *guard = Some(Arc::clone(&sandbox));
            drop(guard);

            self.arm_expiry(&slot, &key, sandbox.id);
            info!(
                %key,
                sandbox_id = sandbox.id,
                tables = level.tables.len(),
                "sandbox provisioned"
            );
            return Ok(sandbox);
        }
    }

    fn arm_expiry(&self, slot: &Slot, key: &SandboxKey, sandbox_id: u64) {
        let pool: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let ttl = self.inner.settings.ttl;
        let key = key.clone();
        let task = self.inner.runtime.spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Some(pool) = pool.upgrade() {
                pool.expire(&key, sandbox_id);
            }
        });
        *slot.expiry.lock() = Some(task.abort_handle());
    }

    /// Evicts every sandbox owned by `session_id` and cancels their timers.
    pub fn release_session(&self, session_id: &str) -> usize {
        let evicted: Vec<(SandboxKey, Arc<Slot>)> = {
            let mut slots = self.inner.slots.lock();
            let keys: Vec<SandboxKey> = slots
                .keys()
                .filter(|k| k.session_id == session_id)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|k| slots.remove(&k).map(|slot| (k, slot)))
                .collect()
        };

        for (key, slot) in &evicted {
            if let Some(task) = slot.expiry.lock().take() {
                task.abort();
            }
            debug!(%key, "sandbox released");
        }
        if !evicted.is_empty() {
            info!(session_id, count = evicted.len(), "session sandboxes released");
        }
        evicted.len()
    }

    pub fn len(&self) -> usize {
        self.inner.slots.lock().len()
    }

    #[cfg(test)]
    pub fn contains(&self, session_id: &str, level_id: u32) -> bool {
        self.inner
            .slots
            .lock()
            .contains_key(&SandboxKey::new(session_id, level_id))
    }

    /// Number of instances ever created by this pool.
    pub fn provisioned_total(&self) -> u64 {
        self.inner.next_id.load(Ordering::Relaxed) - 1
    }
}
