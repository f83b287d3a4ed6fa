use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use time::OffsetDateTime;

use chatbridge_protocol::{BrokerResult, PermissionMode, SessionKey};
use chatbridge_store::SqliteStore;

/// Single-slot pending-input state: the next plain message from the session
/// is consumed as the argument of the command that set it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingInput {
    Cd,
    New,
}

#[derive(Default)]
struct SessionCache {
    workdirs: HashMap<String, String>,
    executors: HashMap<String, String>,
    modes: HashMap<String, PermissionMode>,
    pending: HashMap<String, PendingInput>,
}

/// Write-through cache over the durable session rows. Reads consult memory
/// first and fall back to the store; `reset` clears only the in-memory
/// entries, so a later read repopulates from the store.
pub struct SessionManager {
    store: Arc<SqliteStore>,
    retention: Duration,
    cache: RwLock<SessionCache>,
}

impl SessionManager {
    pub fn new(store: Arc<SqliteStore>, retention: Duration) -> Self {
        Self {
            store,
            retention,
            cache: RwLock::new(SessionCache::default()),
        }
    }

    fn expires_at(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc() + self.retention
    }

    pub fn set_workdir(&self, key: &SessionKey, workdir: &str) -> BrokerResult<()> {
        self.cache
            .write()
            .expect("session cache lock poisoned")
            .workdirs
            .insert(key.to_string(), workdir.to_owned());
        self.store.upsert_session(key, workdir, self.expires_at())
    }

    pub fn workdir(&self, key: &SessionKey) -> BrokerResult<String> {
        if let Some(workdir) = self
            .cache
            .read()
            .expect("session cache lock poisoned")
            .workdirs
            .get(&key.to_string())
        {
            return Ok(workdir.clone());
        }
        let workdir = self.store.session_workdir(key)?;
        if !workdir.is_empty() {
            self.cache
                .write()
                .expect("session cache lock poisoned")
                .workdirs
                .insert(key.to_string(), workdir.clone());
        }
        Ok(workdir)
    }

    /// Clears the in-memory entries for the key. The durable session row
    /// stays; a subsequent read repopulates from the store.
    pub fn reset(&self, key: &SessionKey) {
        let mut cache = self.cache.write().expect("session cache lock poisoned");
        let key = key.to_string();
        cache.workdirs.remove(&key);
        cache.executors.remove(&key);
        cache.modes.remove(&key);
        cache.pending.remove(&key);
    }

    pub fn set_default_executor(&self, key: &SessionKey, executor: &str) {
        self.cache
            .write()
            .expect("session cache lock poisoned")
            .executors
            .insert(key.to_string(), executor.to_owned());
    }

    pub fn default_executor(&self, key: &SessionKey) -> Option<String> {
        self.cache
            .read()
            .expect("session cache lock poisoned")
            .executors
            .get(&key.to_string())
            .cloned()
    }

    pub fn set_permission_mode(&self, key: &SessionKey, mode: PermissionMode) -> BrokerResult<()> {
        self.cache
            .write()
            .expect("session cache lock poisoned")
            .modes
            .insert(key.to_string(), mode);
        self.store
            .set_session_permission_mode(key, mode, self.expires_at())
    }

    pub fn permission_mode(&self, key: &SessionKey) -> BrokerResult<PermissionMode> {
        if let Some(mode) = self
            .cache
            .read()
            .expect("session cache lock poisoned")
            .modes
            .get(&key.to_string())
        {
            return Ok(*mode);
        }
        let mode = self.store.session_permission_mode(key)?;
        self.cache
            .write()
            .expect("session cache lock poisoned")
            .modes
            .insert(key.to_string(), mode);
        Ok(mode)
    }

    /// A second pending action overwrites the first.
    pub fn set_pending_input(&self, key: &SessionKey, action: PendingInput) {
        self.cache
            .write()
            .expect("session cache lock poisoned")
            .pending
            .insert(key.to_string(), action);
    }

    /// Read-and-clear in one step.
    pub fn take_pending_input(&self, key: &SessionKey) -> Option<PendingInput> {
        self.cache
            .write()
            .expect("session cache lock poisoned")
            .pending
            .remove(&key.to_string())
    }
}
