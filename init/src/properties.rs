//! Global property store.
//!
//! Properties are string key/value pairs in a process-wide namespace. The
//! store is cheap to clone and safe to read from any thread; writes commit
//! under a short write-lock section and notify subscribers afterwards.
//!
//! Keys with the `persist.` prefix (plus any configured extras) are
//! mirrored to a backing file on every committed write. The file is
//! rewritten whole via temp-file + rename so readers never observe a
//! partial state.
//!
//! Keys prefixed `ro.` are write-once through [`PropertyStore::set`];
//! internal callers use [`PropertyStore::override_set`] which is always
//! permitted.

use crate::error::{Error, Result};
use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, warn};

/// Diagnostic property set when the persistent file cannot be synced.
pub const SYNC_ERROR_PROP: &str = "init.persist.sync_error";

/// A committed property change, delivered to subscribers in commit order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyChange {
    pub key: String,
    pub value: String,
}

type KeyFilter = Box<dyn Fn(&str) -> bool + Send + Sync>;

struct Subscriber {
    filter: KeyFilter,
    tx: UnboundedSender<PropertyChange>,
}

struct Inner {
    table: RwLock<BTreeMap<String, String>>,
    subscribers: Mutex<Vec<Subscriber>>,
    persist_file: Option<PathBuf>,
    persist_extra: HashSet<String>,
}

/// Thread-safe key/value namespace with change notification.
#[derive(Clone)]
pub struct PropertyStore {
    inner: Arc<Inner>,
}

impl PropertyStore {
    /// Create an in-memory store with no persistent backing.
    pub fn new() -> Self {
        Self::build(None, HashSet::new())
    }

    /// Create a store mirroring persistent keys to `path`.
    ///
    /// An existing backing file is loaded back into memory, so persistent
    /// properties survive re-instantiation.
    pub fn with_persist(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let store = Self::build(Some(path.clone()), HashSet::new());
        if path.exists() {
            match store.load_file(&path) {
                Ok(count) => debug!(count, path = %path.display(), "restored persistent properties"),
                Err(e) => warn!(path = %path.display(), error = %e, "failed to restore persistent properties"),
            }
        }
        store
    }

    /// Mark an extra key (outside the `persist.` prefix) as persistent.
    /// Only effective before the store handle is shared.
    pub fn add_persistent_key(&mut self, key: impl Into<String>) {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => {
                inner.persist_extra.insert(key.into());
            }
            None => warn!("cannot extend the persistent key set of a shared store"),
        }
    }

    fn build(persist_file: Option<PathBuf>, persist_extra: HashSet<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                table: RwLock::new(BTreeMap::new()),
                subscribers: Mutex::new(Vec::new()),
                persist_file,
                persist_extra,
            }),
        }
    }

    /// Look up `key`, returning `default` when absent.
    pub fn get(&self, key: &str, default: &str) -> String {
        let table = self.inner.table.read().unwrap_or_else(|e| e.into_inner());
        table
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    /// Set a property on behalf of configuration scripts.
    ///
    /// Rejected when the key alphabet is violated or when an existing `ro.`
    /// key would be overwritten with a different value. Setting the current
    /// value again commits nothing and notifies nobody.
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        if !valid_key(key) {
            return Err(Error::InvalidKey(key.to_string()));
        }
        if key.starts_with("ro.") {
            let table = self.inner.table.read().unwrap_or_else(|e| e.into_inner());
            if let Some(current) = table.get(key) {
                if current != value {
                    return Err(Error::ReadOnlyProperty(key.to_string()));
                }
            }
        }
        self.commit(key, value);
        Ok(())
    }

    /// Set a property from internal code, bypassing the `ro.` write-once
    /// rule. Invalid keys are logged and dropped.
    pub fn override_set(&self, key: &str, value: &str) {
        if !valid_key(key) {
            warn!(key, "dropping property with invalid key");
            return;
        }
        self.commit(key, value);
    }

    /// Remove a property. Persistent keys are also removed from the
    /// backing file.
    pub fn reset(&self, key: &str) {
        let removed = {
            let mut table = self.inner.table.write().unwrap_or_else(|e| e.into_inner());
            table.remove(key).is_some()
        };
        if !removed {
            return;
        }
        if self.is_persistent(key) {
            self.sync_persist();
        }
        self.notify(key, "");
    }

    /// Ordered snapshot of every `(key, value)` pair.
    pub fn snapshot(&self) -> Vec<(String, String)> {
        let table = self.inner.table.read().unwrap_or_else(|e| e.into_inner());
        table
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Register a change subscriber. Only changes whose key satisfies
    /// `filter` are delivered; delivery order is commit order.
    pub fn subscribe<F>(&self, filter: F) -> UnboundedReceiver<PropertyChange>
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subs = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        subs.push(Subscriber {
            filter: Box::new(filter),
            tx,
        });
        rx
    }

    /// Ingest a `key=value` defaults file without notification or
    /// persistence. Returns the number of entries loaded.
    pub fn load_file(&self, path: &Path) -> Result<usize> {
        let content = std::fs::read_to_string(path)?;
        let mut count = 0;
        let mut table = self.inner.table.write().unwrap_or_else(|e| e.into_inner());
        for line in content.lines() {
            let line = match line.find('#') {
                Some(pos) => &line[..pos],
                None => line,
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                warn!(path = %path.display(), line, "skipping malformed property line");
                continue;
            };
            let key = key.trim();
            if !valid_key(key) {
                warn!(path = %path.display(), key, "skipping property with invalid key");
                continue;
            }
            table.insert(key.to_string(), value.trim().to_string());
            count += 1;
        }
        Ok(count)
    }

    fn commit(&self, key: &str, value: &str) {
        {
            let mut table = self.inner.table.write().unwrap_or_else(|e| e.into_inner());
            match table.get(key) {
                Some(current) if current == value => return,
                _ => {}
            }
            table.insert(key.to_string(), value.to_string());
        }
        debug!(key, value, "property set");
        if self.is_persistent(key) {
            self.sync_persist();
        }
        self.notify(key, value);
    }

    fn is_persistent(&self, key: &str) -> bool {
        self.inner.persist_file.is_some()
            && (key.starts_with("persist.") || self.inner.persist_extra.contains(key))
    }

    /// Rewrite the persistent backing file from the current table.
    fn sync_persist(&self) {
        let Some(path) = &self.inner.persist_file else {
            return;
        };
        if let Err(e) = self.write_persist_file(path) {
            error!(path = %path.display(), error = %e, "failed to sync persistent properties");
            self.commit(SYNC_ERROR_PROP, &e.to_string());
        }
    }

    fn write_persist_file(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            let table = self.inner.table.read().unwrap_or_else(|e| e.into_inner());
            for (key, value) in table.iter() {
                if key.starts_with("persist.") || self.inner.persist_extra.contains(key) {
                    writeln!(file, "{}={}", key, value)?;
                }
            }
            file.sync_all()?;
        }
        std::fs::rename(&tmp, path)
    }

    fn notify(&self, key: &str, value: &str) {
        let mut subs = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        subs.retain(|sub| {
            if !(sub.filter)(key) {
                return true;
            }
            // Drop subscribers whose receiver is gone.
            sub.tx
                .send(PropertyChange {
                    key: key.to_string(),
                    value: value.to_string(),
                })
                .is_ok()
        });
    }
}

impl Default for PropertyStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Property keys are restricted to `[A-Za-z0-9_.-]`.
pub fn valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.' || b == b'-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn set_get_round_trip() {
        let store = PropertyStore::new();
        store.set("sys.test", "value").unwrap();
        assert_eq!(store.get("sys.test", ""), "value");
    }

    #[test]
    fn get_returns_default_when_absent() {
        let store = PropertyStore::new();
        assert_eq!(store.get("never.set", "fallback"), "fallback");
    }

    #[test]
    fn invalid_keys_are_rejected() {
        let store = PropertyStore::new();
        assert!(matches!(
            store.set("bad key", "x"),
            Err(Error::InvalidKey(_))
        ));
        assert!(matches!(store.set("", "x"), Err(Error::InvalidKey(_))));
        assert!(matches!(
            store.set("shell$injection", "x"),
            Err(Error::InvalidKey(_))
        ));
        assert!(store.set("ok_key-1.x", "x").is_ok());
    }

    #[test]
    fn ro_keys_are_write_once_for_scripts() {
        let store = PropertyStore::new();
        store.set("ro.boot.mode", "normal").unwrap();
        assert!(matches!(
            store.set("ro.boot.mode", "recovery"),
            Err(Error::ReadOnlyProperty(_))
        ));
        // Re-setting the same value is fine.
        store.set("ro.boot.mode", "normal").unwrap();
        // The internal API may still override.
        store.override_set("ro.boot.mode", "recovery");
        assert_eq!(store.get("ro.boot.mode", ""), "recovery");
    }

    #[test]
    fn idempotent_set_does_not_notify() {
        let store = PropertyStore::new();
        let mut rx = store.subscribe(|_| true);

        store.set("a.b", "1").unwrap();
        assert_eq!(rx.try_recv().unwrap().value, "1");

        store.set("a.b", "1").unwrap();
        assert!(rx.try_recv().is_err());

        store.set("a.b", "2").unwrap();
        assert_eq!(rx.try_recv().unwrap().value, "2");
    }

    #[test]
    fn subscriber_filter_limits_delivery() {
        let store = PropertyStore::new();
        let mut rx = store.subscribe(|key| key.starts_with("init.svc."));

        store.set("other.key", "x").unwrap();
        store.override_set("init.svc.echo", "running");

        let change = rx.try_recv().unwrap();
        assert_eq!(change.key, "init.svc.echo");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn snapshot_is_ordered() {
        let store = PropertyStore::new();
        store.set("z.last", "3").unwrap();
        store.set("a.first", "1").unwrap();
        store.set("m.middle", "2").unwrap();

        let keys: Vec<String> = store.snapshot().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a.first", "m.middle", "z.last"]);
    }

    #[test]
    fn persistent_property_survives_reinstantiation() {
        let dir = TempDir::new().unwrap();
        let backing = dir.path().join("persist.prop");

        {
            let store = PropertyStore::with_persist(&backing);
            store.set("persist.x", "42").unwrap();
            store.set("volatile.y", "no").unwrap();
        }

        let store = PropertyStore::with_persist(&backing);
        assert_eq!(store.get("persist.x", ""), "42");
        assert_eq!(store.get("volatile.y", ""), "");
    }

    #[test]
    fn persist_file_holds_only_persistent_keys() {
        let dir = TempDir::new().unwrap();
        let backing = dir.path().join("persist.prop");

        let store = PropertyStore::with_persist(&backing);
        store.set("persist.a", "1").unwrap();
        store.set("transient.b", "2").unwrap();

        let content = std::fs::read_to_string(&backing).unwrap();
        assert!(content.contains("persist.a=1"));
        assert!(!content.contains("transient.b"));
    }

    #[test]
    fn reset_removes_key_and_persisted_entry() {
        let dir = TempDir::new().unwrap();
        let backing = dir.path().join("persist.prop");

        let store = PropertyStore::with_persist(&backing);
        store.set("persist.gone", "1").unwrap();
        store.reset("persist.gone");

        assert_eq!(store.get("persist.gone", "absent"), "absent");
        let content = std::fs::read_to_string(&backing).unwrap();
        assert!(!content.contains("persist.gone"));
    }

    #[test]
    fn load_file_parses_defaults_format() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("prop.default");
        std::fs::write(
            &path,
            "# defaults\nro.product=widget\n\nro.hw = pi # inline comment\nbroken line\n",
        )
        .unwrap();

        let store = PropertyStore::new();
        let count = store.load_file(&path).unwrap();
        assert_eq!(count, 2);
        assert_eq!(store.get("ro.product", ""), "widget");
        assert_eq!(store.get("ro.hw", ""), "pi");
    }
}
