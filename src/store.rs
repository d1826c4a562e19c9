//! # Settings Store
//!
//! Typed access to the persisted settings record shared with the rotation
//! daemon.
//!
//! ## Storage
//! Values live in a flat JSON object at
//! `~/.config/desk-changer/<schema_id>.json`. Keys missing from the file, or
//! stored with the wrong type or out of range, read as their schema default.
//!
//! A write holds an advisory lock on `<values file>.lock` while it re-reads
//! the file, replaces one key and renames a fresh temp file over it. Two
//! handles writing different keys therefore never lose each other's write.
//!
//! ## Change notification
//! - A `set` through this handle queues a `StoreChanged` event on the main
//!   loop; watches fire when the loop drains, never inside `set` itself.
//! - A `notify` watcher on the file's directory queues `StoreFileChanged`; the
//!   loop re-reads the file and fires watches for keys whose value differs
//!   from the cache.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};

use fs2::FileExt;
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::event_loop::{LoopEvent, LoopSender};
use crate::registry::{Subscription, SubscriptionId, SubscriptionKind};
use crate::schema::{FromValue, Schema, Value};

/// Key names declared by the desk-changer schema.
pub mod keys {
    pub const CURRENT_PROFILE: &str = "current-profile";
    pub const INTERVAL: &str = "interval";
    pub const NOTIFICATIONS: &str = "notifications";
    pub const AUTO_ROTATE: &str = "auto-rotate";
    pub const TIMER_ENABLED: &str = "timer-enabled";
    pub const RANDOM: &str = "random";
    pub const PROFILES: &str = "profiles";
}

/// A named set of wallpaper locations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    #[serde(default)]
    pub paths: BTreeSet<String>,
}

/// Snapshot of every field the panel cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigRecord {
    pub current_profile: String,
    pub interval: i64,
    pub notifications: bool,
    pub auto_rotate: bool,
    pub timer_enabled: bool,
    pub random: bool,
    pub profiles: Vec<Profile>,
}

impl ConfigRecord {
    /// The profile `current_profile` names, if it names one.
    pub fn active_profile(&self) -> Option<&Profile> {
        if self.current_profile.is_empty() {
            return None;
        }
        self.profiles.iter().find(|p| p.name == self.current_profile)
    }
}

/// Which keys a watch is interested in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPattern {
    /// `*`
    Any,
    /// `prefix*`
    Prefix(String),
    Exact(String),
}

impl KeyPattern {
    pub fn parse(pattern: &str) -> Self {
        if pattern == "*" {
            KeyPattern::Any
        } else if let Some(prefix) = pattern.strip_suffix('*') {
            KeyPattern::Prefix(prefix.to_string())
        } else {
            KeyPattern::Exact(pattern.to_string())
        }
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            KeyPattern::Any => true,
            KeyPattern::Prefix(prefix) => key.starts_with(prefix.as_str()),
            KeyPattern::Exact(exact) => key == exact,
        }
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPattern::Any => write!(f, "*"),
            KeyPattern::Prefix(prefix) => write!(f, "{prefix}*"),
            KeyPattern::Exact(exact) => write!(f, "{exact}"),
        }
    }
}

type WatchCallback = Rc<RefCell<Box<dyn FnMut(&str, &Value)>>>;

struct Watch {
    pattern: KeyPattern,
    callback: WatchCallback,
}

struct StoreInner {
    schema: Schema,
    values_path: PathBuf,
    /// Every schema key, defaults filled in.
    cache: RefCell<BTreeMap<String, Value>>,
    watches: RefCell<BTreeMap<SubscriptionId, Watch>>,
    sender: LoopSender,
    file_watcher: RefCell<Option<RecommendedWatcher>>,
    closed: Cell<bool>,
}

/// Handle to the persisted settings record. Cheap to clone; all clones share
/// one cache and one watch table.
#[derive(Clone)]
pub struct ConfigStore {
    inner: Rc<StoreInner>,
}

impl ConfigStore {
    /// Where the values file for `schema_id` lives by default.
    pub fn default_values_path(schema_id: &str) -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("desk-changer").join(format!("{schema_id}.json")))
    }

    /// Resolves the schema and loads the current values.
    pub fn open(
        schema_id: &str,
        search_path: &[PathBuf],
        sender: LoopSender,
    ) -> Result<Self, StoreError> {
        let values_path = Self::default_values_path(schema_id).ok_or_else(|| StoreError::Io {
            path: PathBuf::from("~/.config"),
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "could not determine config directory",
            ),
        })?;
        Self::open_at(schema_id, search_path, values_path, sender)
    }

    /// Like [`open`](Self::open) with an explicit values file.
    pub fn open_at(
        schema_id: &str,
        search_path: &[PathBuf],
        values_path: PathBuf,
        sender: LoopSender,
    ) -> Result<Self, StoreError> {
        let schema = Schema::resolve(schema_id, search_path)?;

        if let Some(parent) = values_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let cache = read_values(&schema, &values_path)?;
        let file_watcher = watch_values_file(&values_path, sender.clone());

        info!(
            "Opened settings {} from {} ({} keys) at {}",
            schema.id(),
            schema.path().display(),
            cache.len(),
            values_path.display()
        );

        Ok(Self {
            inner: Rc::new(StoreInner {
                schema,
                values_path,
                cache: RefCell::new(cache),
                watches: RefCell::new(BTreeMap::new()),
                sender,
                file_watcher: RefCell::new(file_watcher),
                closed: Cell::new(false),
            }),
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    pub fn values_path(&self) -> &Path {
        &self.inner.values_path
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// Reads a key as `T`. Fails with `TypeMismatch` if the schema declares a
    /// different type for it.
    pub fn get<T: FromValue>(&self, key: &str) -> Result<T, StoreError> {
        let declared = self.inner.schema.key(key)?;
        if declared.key_type != T::KEY_TYPE {
            return Err(StoreError::TypeMismatch {
                key: key.to_string(),
                expected: declared.key_type,
                actual: T::KEY_TYPE,
            });
        }

        let value = self.get_value(key)?;
        T::from_value(&value).ok_or_else(|| StoreError::TypeMismatch {
            key: key.to_string(),
            expected: declared.key_type,
            actual: value.key_type(),
        })
    }

    pub fn get_value(&self, key: &str) -> Result<Value, StoreError> {
        let declared = self.inner.schema.key(key)?;
        Ok(self
            .inner
            .cache
            .borrow()
            .get(key)
            .cloned()
            .unwrap_or_else(|| declared.default.clone()))
    }

    pub fn get_bool(&self, key: &str) -> Result<bool, StoreError> {
        self.get(key)
    }

    pub fn get_int(&self, key: &str) -> Result<i64, StoreError> {
        self.get(key)
    }

    pub fn get_string(&self, key: &str) -> Result<String, StoreError> {
        self.get(key)
    }

    /// Writes one key to disk and queues the change notification.
    pub fn set(&self, key: &str, value: impl Into<Value>) -> Result<(), StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }

        let value = value.into();
        self.inner.schema.check(key, &value)?;
        write_value(&self.inner.values_path, key, &value)?;

        debug!("Set {key} = {value}");
        self.inner
            .cache
            .borrow_mut()
            .insert(key.to_string(), value.clone());
        self.inner.sender.post(LoopEvent::StoreChanged {
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    /// Registers `callback` for changes to keys matching `pattern`.
    ///
    /// The callback receives the key and the value carried by the change.
    /// Writes made through this same handle are delivered too.
    pub fn watch(
        &self,
        pattern: &str,
        callback: impl FnMut(&str, &Value) + 'static,
    ) -> Subscription {
        if self.is_closed() {
            warn!("watch({pattern}) on a closed store");
            return Subscription::inert(SubscriptionKind::StoreWatch, pattern);
        }

        let id = SubscriptionId::next();
        let pattern = KeyPattern::parse(pattern);
        let target = pattern.to_string();
        self.inner.watches.borrow_mut().insert(
            id,
            Watch {
                pattern,
                callback: Rc::new(RefCell::new(Box::new(callback))),
            },
        );

        let weak: Weak<StoreInner> = Rc::downgrade(&self.inner);
        Subscription::new(id, SubscriptionKind::StoreWatch, target, move || {
            if let Some(inner) = weak.upgrade() {
                inner.watches.borrow_mut().remove(&id);
            }
        })
    }

    /// Number of watches still attached.
    pub fn watch_count(&self) -> usize {
        self.inner.watches.borrow().len()
    }

    /// Routes a `StoreChanged` event from the loop.
    pub(crate) fn handle_changed(&self, key: &str, value: &Value) {
        if self.is_closed() {
            return;
        }
        self.notify(key, value);
    }

    /// Routes a `StoreFileChanged` event from the loop.
    pub(crate) fn reload(&self) {
        if self.is_closed() {
            return;
        }

        let fresh = match read_values(&self.inner.schema, &self.inner.values_path) {
            Ok(values) => values,
            Err(e) => {
                warn!("Failed to reload settings: {e}");
                return;
            }
        };

        let mut changed = Vec::new();
        {
            let mut cache = self.inner.cache.borrow_mut();
            for (key, value) in fresh {
                if cache.get(&key) != Some(&value) {
                    cache.insert(key.clone(), value.clone());
                    changed.push((key, value));
                }
            }
        }

        for (key, value) in changed {
            debug!("External change: {key} = {value}");
            self.notify(&key, &value);
        }
    }

    fn notify(&self, key: &str, value: &Value) {
        let ids: Vec<SubscriptionId> = self
            .inner
            .watches
            .borrow()
            .iter()
            .filter(|(_, w)| w.pattern.matches(key))
            .map(|(id, _)| *id)
            .collect();

        for id in ids {
            // Looked up again each time: an earlier callback may have released it.
            let callback = match self.inner.watches.borrow().get(&id) {
                Some(watch) => watch.callback.clone(),
                None => continue,
            };
            match callback.try_borrow_mut() {
                Ok(mut cb) => {
                    let f: &mut dyn FnMut(&str, &Value) = &mut **cb;
                    f(key, value);
                }
                Err(_) => error!("Watch {id} re-entered while handling {key}"),
            };
        }
    }

    /// Releases every watch and stops observing the file. A second call does
    /// nothing.
    pub fn close(&self) {
        if self.inner.closed.replace(true) {
            return;
        }

        let watches = std::mem::take(&mut *self.inner.watches.borrow_mut());
        let file_watcher = self.inner.file_watcher.borrow_mut().take();
        info!(
            "Closed settings {} ({} watches dropped)",
            self.inner.schema.id(),
            watches.len()
        );
        drop(watches);
        drop(file_watcher);
    }

    // --- typed facade over the desk-changer keys ---

    pub fn record(&self) -> Result<ConfigRecord, StoreError> {
        Ok(ConfigRecord {
            current_profile: self.get_string(keys::CURRENT_PROFILE)?,
            interval: self.get_int(keys::INTERVAL)?,
            notifications: self.get_bool(keys::NOTIFICATIONS)?,
            auto_rotate: self.get_bool(keys::AUTO_ROTATE)?,
            timer_enabled: self.get_bool(keys::TIMER_ENABLED)?,
            random: self.get_bool(keys::RANDOM)?,
            profiles: self.profiles()?,
        })
    }

    /// The `profiles` key, parsed.
    pub fn profiles(&self) -> Result<Vec<Profile>, StoreError> {
        let text = self.get_string(keys::PROFILES)?;
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&text).map_err(|source| StoreError::Parse {
            key: keys::PROFILES.to_string(),
            source,
        })
    }

    pub fn set_profiles(&self, profiles: &[Profile]) -> Result<(), StoreError> {
        let text = serde_json::to_string(profiles).map_err(|source| StoreError::Parse {
            key: keys::PROFILES.to_string(),
            source,
        })?;
        self.set(keys::PROFILES, text)
    }

    /// The profile named by `current-profile`. A name that matches nothing, or
    /// an unreadable profile list, counts as no active profile.
    pub fn active_profile(&self) -> Option<Profile> {
        let current = self.get_string(keys::CURRENT_PROFILE).ok()?;
        if current.is_empty() {
            return None;
        }
        match self.profiles() {
            Ok(profiles) => profiles.into_iter().find(|p| p.name == current),
            Err(e) => {
                warn!("{e}");
                None
            }
        }
    }
}

impl fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigStore")
            .field("schema", &self.inner.schema.id())
            .field("values_path", &self.inner.values_path)
            .field("watches", &self.watch_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Reads the values file, falling back to schema defaults for anything
/// missing, unparsable, mistyped or below its minimum. A missing file is not
/// an error.
fn read_values(schema: &Schema, path: &Path) -> Result<BTreeMap<String, Value>, StoreError> {
    let mut values: BTreeMap<String, Value> = schema
        .keys()
        .map(|k| (k.name.clone(), k.default.clone()))
        .collect();

    for (key, raw) in read_raw(path)? {
        let Ok(declared) = schema.key(&key) else {
            continue;
        };
        match serde_json::from_value::<Value>(raw) {
            Ok(value) => match schema.check(&key, &value) {
                Ok(()) => {
                    values.insert(key, value);
                }
                Err(e) => warn!("Ignoring stored '{key}' in {}: {e}", path.display()),
            },
            Err(_) => warn!(
                "Ignoring stored '{key}' in {}: not a {}",
                path.display(),
                declared.key_type
            ),
        }
    }

    Ok(values)
}

fn read_raw(path: &Path) -> Result<serde_json::Map<String, serde_json::Value>, StoreError> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Default::default()),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    if content.trim().is_empty() {
        return Ok(Default::default());
    }

    match serde_json::from_str(&content) {
        Ok(map) => Ok(map),
        Err(e) => {
            warn!("Settings file {} is corrupt, using defaults: {e}", path.display());
            Ok(Default::default())
        }
    }
}

/// Replaces one key in the values file.
fn write_value(path: &Path, key: &str, value: &Value) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    let _lock = lock_values_file(path).map_err(io_err)?;
    let mut raw = read_raw(path)?;
    let encoded = serde_json::to_value(value).map_err(|source| StoreError::Parse {
        key: key.to_string(),
        source,
    })?;
    raw.insert(key.to_string(), encoded);

    let content = serde_json::to_string_pretty(&raw).map_err(|source| StoreError::Parse {
        key: key.to_string(),
        source,
    })?;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(content.as_bytes()).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

/// Takes the exclusive advisory lock guarding writes to `path`. Held until
/// the returned file is dropped.
fn lock_values_file(path: &Path) -> std::io::Result<File> {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(".lock");
    let lock = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path.with_file_name(name))?;
    lock.lock_exclusive()?;
    Ok(lock)
}

/// Starts watching the directory holding `path`. The file itself may be
/// replaced by rename at any time, so the watch is on its parent.
fn watch_values_file(path: &Path, sender: LoopSender) -> Option<RecommendedWatcher> {
    let dir = path.parent()?.to_path_buf();
    let file_name = path.file_name()?.to_os_string();

    let config = NotifyConfig::default().with_poll_interval(std::time::Duration::from_secs(1));
    let watcher: Result<RecommendedWatcher, _> = Watcher::new(
        move |res: Result<notify::Event, notify::Error>| {
            let Ok(event) = res else {
                return;
            };
            let ours = event
                .paths
                .iter()
                .any(|p| p.file_name() == Some(file_name.as_os_str()));
            if ours
                && matches!(
                    event.kind,
                    notify::EventKind::Modify(_)
                        | notify::EventKind::Create(_)
                        | notify::EventKind::Remove(_)
                )
            {
                sender.post(LoopEvent::StoreFileChanged);
            }
        },
        config,
    );

    match watcher {
        Ok(mut w) => match w.watch(&dir, RecursiveMode::NonRecursive) {
            Ok(()) => Some(w),
            Err(e) => {
                warn!("Cannot watch {}: {e}; external changes will be missed", dir.display());
                None
            }
        },
        Err(e) => {
            warn!("Cannot create file watcher: {e}; external changes will be missed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::MainLoop;
    use crate::test_support::{pump_store, write_schema, SCHEMA_ID};

    struct Fixture {
        _dir: tempfile::TempDir,
        schema_dir: PathBuf,
        values_path: PathBuf,
        main_loop: MainLoop,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let schema_dir = dir.path().join("schemas");
            write_schema(&schema_dir);
            let values_path = dir.path().join("settings").join("values.json");
            Self {
                _dir: dir,
                schema_dir,
                values_path,
                main_loop: MainLoop::new(),
            }
        }

        fn open(&self) -> ConfigStore {
            ConfigStore::open_at(
                SCHEMA_ID,
                &[self.schema_dir.clone()],
                self.values_path.clone(),
                self.main_loop.sender(),
            )
            .unwrap()
        }
    }

    fn recorder(store: &ConfigStore, pattern: &str) -> (Subscription, Rc<RefCell<Vec<(String, Value)>>>) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let sub = store.watch(pattern, move |key, value| {
            sink.borrow_mut().push((key.to_string(), value.clone()));
        });
        (sub, seen)
    }

    #[test]
    fn test_defaults_without_values_file() {
        let fx = Fixture::new();
        let store = fx.open();
        assert_eq!(store.get_int(keys::INTERVAL).unwrap(), 300);
        assert!(store.get_bool(keys::AUTO_ROTATE).unwrap());
        assert_eq!(store.get_string(keys::CURRENT_PROFILE).unwrap(), "");
    }

    #[test]
    fn test_wrong_type_is_type_mismatch() {
        let fx = Fixture::new();
        let store = fx.open();
        assert!(matches!(
            store.get_int(keys::NOTIFICATIONS),
            Err(StoreError::TypeMismatch { .. })
        ));
        assert!(matches!(
            store.set(keys::INTERVAL, "soon"),
            Err(StoreError::TypeMismatch { .. })
        ));
        assert!(matches!(
            store.get_bool("no-such-key"),
            Err(StoreError::UnknownKey(_))
        ));
    }

    #[test]
    fn test_interval_minimum_enforced() {
        let fx = Fixture::new();
        let store = fx.open();
        assert!(matches!(
            store.set(keys::INTERVAL, 0i64),
            Err(StoreError::OutOfRange { .. })
        ));
        assert_eq!(store.get_int(keys::INTERVAL).unwrap(), 300);
    }

    #[test]
    fn test_set_is_durable_and_visible_to_other_handles() {
        let fx = Fixture::new();
        let store = fx.open();
        store.set(keys::INTERVAL, 60i64).unwrap();
        assert_eq!(store.get_int(keys::INTERVAL).unwrap(), 60);

        let other = fx.open();
        assert_eq!(other.get_int(keys::INTERVAL).unwrap(), 60);
    }

    #[test]
    fn test_watch_fires_asynchronously_with_written_value() {
        let fx = Fixture::new();
        let store = fx.open();
        let (sub, seen) = recorder(&store, keys::NOTIFICATIONS);

        store.set(keys::NOTIFICATIONS, false).unwrap();
        assert!(seen.borrow().is_empty(), "delivery must wait for the loop");

        pump_store(&fx.main_loop, &store);
        assert_eq!(
            *seen.borrow(),
            vec![(keys::NOTIFICATIONS.to_string(), Value::Bool(false))]
        );

        let registry = crate::registry::SubscriptionRegistry::new();
        registry.register(sub);
        registry.release_all();
    }

    #[test]
    fn test_back_to_back_sets_delivered_in_order() {
        let fx = Fixture::new();
        let store = fx.open();
        let (sub, seen) = recorder(&store, keys::INTERVAL);

        store.set(keys::INTERVAL, 10i64).unwrap();
        store.set(keys::INTERVAL, 20i64).unwrap();
        pump_store(&fx.main_loop, &store);

        let values: Vec<Value> = seen.borrow().iter().map(|(_, v)| v.clone()).collect();
        assert_eq!(values, vec![Value::Int(10), Value::Int(20)]);
        assert_eq!(store.get_int(keys::INTERVAL).unwrap(), 20);

        let registry = crate::registry::SubscriptionRegistry::new();
        registry.register(sub);
        registry.release_all();
    }

    #[test]
    fn test_external_write_detected_on_reload() {
        let fx = Fixture::new();
        let store = fx.open();
        let (sub, seen) = recorder(&store, "*");

        // Another process rewrites the file.
        std::fs::write(
            &fx.values_path,
            r#"{ "auto-rotate": false, "interval": 300, "unrelated": 1 }"#,
        )
        .unwrap();
        fx.main_loop.sender().post(LoopEvent::StoreFileChanged);
        pump_store(&fx.main_loop, &store);

        // interval equals the default already cached, so only auto-rotate changed.
        assert_eq!(
            *seen.borrow(),
            vec![(keys::AUTO_ROTATE.to_string(), Value::Bool(false))]
        );
        assert!(!store.get_bool(keys::AUTO_ROTATE).unwrap());

        let registry = crate::registry::SubscriptionRegistry::new();
        registry.register(sub);
        registry.release_all();
    }

    #[test]
    fn test_self_write_not_delivered_twice_by_reload() {
        let fx = Fixture::new();
        let store = fx.open();
        let (sub, seen) = recorder(&store, keys::AUTO_ROTATE);

        store.set(keys::AUTO_ROTATE, false).unwrap();
        fx.main_loop.sender().post(LoopEvent::StoreFileChanged);
        pump_store(&fx.main_loop, &store);

        assert_eq!(seen.borrow().len(), 1);

        let registry = crate::registry::SubscriptionRegistry::new();
        registry.register(sub);
        registry.release_all();
    }

    #[test]
    fn test_set_preserves_keys_written_by_others() {
        let fx = Fixture::new();
        let store = fx.open();
        std::fs::write(&fx.values_path, r#"{ "current-profile": "vacation" }"#).unwrap();

        store.set(keys::NOTIFICATIONS, false).unwrap();

        let other = fx.open();
        assert_eq!(other.get_string(keys::CURRENT_PROFILE).unwrap(), "vacation");
        assert!(!other.get_bool(keys::NOTIFICATIONS).unwrap());
    }

    #[test]
    fn test_released_watch_never_fires() {
        let fx = Fixture::new();
        let store = fx.open();
        let registry = crate::registry::SubscriptionRegistry::new();
        let (sub, seen) = recorder(&store, keys::INTERVAL);
        let id = registry.register(sub);

        store.set(keys::INTERVAL, 42i64).unwrap();
        registry.release(id);
        pump_store(&fx.main_loop, &store);

        assert!(seen.borrow().is_empty());
        assert_eq!(store.watch_count(), 0);
    }

    #[test]
    fn test_close_is_idempotent_and_drops_watches() {
        let fx = Fixture::new();
        let store = fx.open();
        let registry = crate::registry::SubscriptionRegistry::new();
        let (sub, seen) = recorder(&store, "*");
        registry.register(sub);

        store.set(keys::INTERVAL, 42i64).unwrap();
        store.close();
        store.close();
        pump_store(&fx.main_loop, &store);

        assert!(seen.borrow().is_empty());
        assert_eq!(store.watch_count(), 0);
        assert!(matches!(store.set(keys::INTERVAL, 1i64), Err(StoreError::Closed)));
        // Release after close is a no-op.
        assert_eq!(registry.release_all(), 1);
        // Reads still served from cache.
        assert_eq!(store.get_int(keys::INTERVAL).unwrap(), 42);
    }

    #[test]
    fn test_key_pattern() {
        assert!(KeyPattern::parse("*").matches("interval"));
        assert!(KeyPattern::parse("timer*").matches("timer-enabled"));
        assert!(!KeyPattern::parse("timer*").matches("interval"));
        assert!(KeyPattern::parse("interval").matches("interval"));
        assert!(!KeyPattern::parse("interval").matches("interval-x"));
    }

    #[test]
    fn test_profiles_and_active_profile() {
        let fx = Fixture::new();
        let store = fx.open();
        let vacation = Profile {
            name: "vacation".into(),
            paths: ["file:///home/me/beach".to_string()].into_iter().collect(),
        };
        store.set_profiles(std::slice::from_ref(&vacation)).unwrap();

        store.set(keys::CURRENT_PROFILE, "vacation").unwrap();
        assert_eq!(store.active_profile(), Some(vacation.clone()));

        store.set(keys::CURRENT_PROFILE, "work").unwrap();
        assert_eq!(store.active_profile(), None);

        let record = store.record().unwrap();
        assert!(record.random);
        assert_eq!(record.profiles, vec![vacation]);
        assert!(record.active_profile().is_none());
    }

    #[test]
    fn test_corrupt_profiles_tolerated() {
        let fx = Fixture::new();
        let store = fx.open();
        store.set(keys::PROFILES, "{not json").unwrap();
        store.set(keys::CURRENT_PROFILE, "default").unwrap();

        assert!(matches!(store.profiles(), Err(StoreError::Parse { .. })));
        assert_eq!(store.active_profile(), None);
    }

    #[test]
    fn test_stored_value_below_minimum_falls_back_to_default() {
        let fx = Fixture::new();
        std::fs::create_dir_all(fx.values_path.parent().unwrap()).unwrap();
        std::fs::write(&fx.values_path, r#"{ "interval": -5, "random": false }"#).unwrap();
        let store = fx.open();
        assert_eq!(store.get_int(keys::INTERVAL).unwrap(), 300);
        assert!(!store.get_bool(keys::RANDOM).unwrap());

        // An external write that goes out of range is ignored on reload too.
        let (sub, seen) = recorder(&store, keys::INTERVAL);
        std::fs::write(&fx.values_path, r#"{ "interval": 0 }"#).unwrap();
        fx.main_loop.sender().post(LoopEvent::StoreFileChanged);
        pump_store(&fx.main_loop, &store);
        assert!(seen.borrow().is_empty());
        assert_eq!(store.get_int(keys::INTERVAL).unwrap(), 300);

        let registry = crate::registry::SubscriptionRegistry::new();
        registry.register(sub);
        registry.release_all();
    }

    #[test]
    fn test_concurrent_writers_keep_every_write() {
        let fx = Fixture::new();
        let writer = |key: &'static str| {
            let schema_dir = fx.schema_dir.clone();
            let values_path = fx.values_path.clone();
            std::thread::spawn(move || {
                let main_loop = MainLoop::new();
                let store =
                    ConfigStore::open_at(SCHEMA_ID, &[schema_dir], values_path, main_loop.sender())
                        .unwrap();
                for i in 1..=200i64 {
                    let value = match key {
                        keys::INTERVAL => Value::Int(i),
                        _ => Value::Str(format!("p{i}")),
                    };
                    store.set(key, value).unwrap();
                }
                store.close();
            })
        };

        let a = writer(keys::INTERVAL);
        let b = writer(keys::CURRENT_PROFILE);
        a.join().unwrap();
        b.join().unwrap();

        let store = fx.open();
        assert_eq!(store.get_int(keys::INTERVAL).unwrap(), 200);
        assert_eq!(store.get_string(keys::CURRENT_PROFILE).unwrap(), "p200");
    }

    #[test]
    fn test_mistyped_stored_value_falls_back_to_default() {
        let fx = Fixture::new();
        std::fs::create_dir_all(fx.values_path.parent().unwrap()).unwrap();
        std::fs::write(&fx.values_path, r#"{ "interval": "ten" }"#).unwrap();
        let store = fx.open();
        assert_eq!(store.get_int(keys::INTERVAL).unwrap(), 300);
    }
}
