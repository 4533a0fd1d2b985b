//! A typed, dirty-tracked mirror of a Tor daemon's configuration.
//!
//! The schema is learned at runtime: `GETINFO config/names` reports
//! every key together with a type tag, and each key's current value is
//! then fetched with `GETCONF`.  Writes are cached locally and pushed to
//! the daemon in a single atomic `SETCONF` when [`TorConfig::save`] is
//! called; reads always reflect the running daemon, not the pending
//! writes.
//!
//! Hidden services are configured through a positional group of options
//! and get special treatment; see [`HiddenService`].

mod hs;
mod types;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use tor_ctrlproto::{ControlConn, DEFAULT_VALUE};

use crate::err::ConfigError;

pub use hs::HiddenService;
use hs::{HsDirty, parse_hidden_service_options};
pub use types::{ConfType, ConfValue};

/// One known configuration key.
#[derive(Clone, Debug)]
struct KeyEntry {
    /// The key's name in the case the daemon reported.
    canonical: String,
    /// The key's type tag.
    kind: ConfType,
    /// The cached value, as last seen on (or pushed to) the daemon.
    value: ConfValue,
}

/// A mirror of the daemon's configuration.
///
/// Obtain one with [`TorConfig::bootstrap`] (attached to a daemon) or
/// [`TorConfig::new_detached`] (free-standing, e.g. to seed a launch).
/// Key names are matched case-insensitively; the canonical case from
/// the daemon is preserved for wire traffic.
#[derive(Debug)]
pub struct TorConfig {
    /// The connection this mirror belongs to; None for a detached config.
    conn: Option<ControlConn>,
    /// Every known key, indexed by lowercased name.
    entries: HashMap<String, KeyEntry>,
    /// The hidden services the daemon is configured with.
    hidden_services: Vec<HiddenService>,
    /// Values changed since the last save, by canonical name.
    ///
    /// A BTreeMap so that the SETCONF we assemble is deterministic.
    unsaved: BTreeMap<String, ConfValue>,
    /// Set when a hidden service (or the service list) changes.
    hs_dirty: HsDirty,
}

impl TorConfig {
    /// Create a configuration with no attached daemon and no schema.
    ///
    /// Writes are stored without validation; [`TorConfig::create_torrc`]
    /// serializes them.  This is the input the launcher wants.
    pub fn new_detached() -> TorConfig {
        TorConfig {
            conn: None,
            entries: HashMap::new(),
            hidden_services: Vec::new(),
            unsaved: BTreeMap::new(),
            hs_dirty: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Learn the schema and current configuration from the daemon.
    pub async fn bootstrap(conn: &ControlConn) -> Result<TorConfig, ConfigError> {
        let names = conn.get_info(&["config/names"]).await?;
        let body = names
            .get("config/names")
            .ok_or_else(|| ConfigError::Bootstrap("daemon did not answer config/names".into()))?;

        let mut cfg = TorConfig::new_detached();
        cfg.conn = Some(conn.clone());

        for line in body.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (name, tag) = line.split_once(' ').ok_or_else(|| {
                ConfigError::Bootstrap(format!("bad config/names line {:?}", line))
            })?;

            if name == "HiddenServiceOptions" {
                // Compound read: the grouping of the reply lines is
                // positional, so we need them in arrival order.
                let reply = conn.queue_command("GETCONF HiddenServiceOptions").await?;
                let mut services = parse_hidden_service_options(
                    reply
                        .lines
                        .iter()
                        .map(|l| l.payload.as_str())
                        .filter(|p| p.contains('=')),
                )?;
                for service in &mut services {
                    service.attach(Arc::clone(&cfg.hs_dirty));
                }
                debug!("learned {} hidden service(s)", services.len());
                cfg.hidden_services = services;
                continue;
            }

            let kind = ConfType::from_tag(tag)?;
            if kind == ConfType::Dependant {
                continue;
            }

            let conf = conn.get_conf(&[name]).await?;
            let values = lookup_ci(&conf, name).cloned().unwrap_or_default();
            let value = if values.iter().any(|v| v == DEFAULT_VALUE) {
                ConfValue::default_for(kind)
            } else {
                ConfValue::parse_wire(kind, &values).map_err(|e| name_error(e, name))?
            };
            cfg.entries.insert(
                name.to_lowercase(),
                KeyEntry {
                    canonical: name.to_owned(),
                    kind,
                    value,
                },
            );
        }
        debug!("configuration mirror ready: {} keys", cfg.entries.len());
        Ok(cfg)
    }

    /// Look up a key, case-insensitively.
    fn entry(&self, name: &str) -> Result<&KeyEntry, ConfigError> {
        self.entries
            .get(&name.to_lowercase())
            .ok_or_else(|| ConfigError::UnknownKey(name.to_owned()))
    }

    /// The canonical (daemon-reported) name for a key.
    pub fn canonical_name(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&name.to_lowercase())
            .map(|e| e.canonical.as_str())
    }

    /// The type of a key.
    pub fn key_type(&self, name: &str) -> Result<ConfType, ConfigError> {
        Ok(self.entry(name)?.kind)
    }

    /// Every known key, in no particular order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.values().map(|e| e.canonical.as_str())
    }

    /// Read a key's cached value.
    ///
    /// This reflects the running daemon, *not* values written since the
    /// last [`save`](TorConfig::save).
    pub fn get(&self, name: &str) -> Result<&ConfValue, ConfigError> {
        Ok(&self.entry(name)?.value)
    }

    /// Write a key into the unsaved overlay, validating against the
    /// key's type.  Nothing reaches the daemon until
    /// [`save`](TorConfig::save).
    ///
    /// On a detached config there is no schema, so any value is
    /// accepted under the name given.
    pub fn set<V: Into<ConfValue>>(&mut self, name: &str, value: V) -> Result<(), ConfigError> {
        let value = value.into();
        match self.entries.get(&name.to_lowercase()) {
            Some(entry) => {
                if !value.matches_kind(entry.kind) {
                    return Err(ConfigError::Validation {
                        key: entry.canonical.clone(),
                        reason: format!("{:?} does not fit a {} key", value, entry.kind),
                    });
                }
                let canonical = entry.canonical.clone();
                self.unsaved.insert(canonical, value);
            }
            None if self.conn.is_none() => {
                self.unsaved.insert(name.to_owned(), value);
            }
            None => return Err(ConfigError::UnknownKey(name.to_owned())),
        }
        Ok(())
    }

    /// Write a key from its string form, using the key's own parser.
    pub fn set_from_str(&mut self, name: &str, s: &str) -> Result<(), ConfigError> {
        let value = match self.entries.get(&name.to_lowercase()) {
            Some(entry) => ConfValue::parse(entry.kind, s)
                .map_err(|e| name_error(e, &entry.canonical))?,
            None => ConfValue::Str(s.to_owned()),
        };
        self.set(name, value)
    }

    /// Write a key without consulting the schema.
    ///
    /// The launcher uses this to force its bookkeeping options into a
    /// seed configuration.
    pub(crate) fn set_unchecked<V: Into<ConfValue>>(&mut self, name: &str, value: V) {
        let canonical = self
            .canonical_name(name)
            .map(str::to_owned)
            .unwrap_or_else(|| name.to_owned());
        self.unsaved.insert(canonical, value.into());
    }

    /// Borrow a list-valued key for mutation.
    ///
    /// The first borrow copies the cached list into the unsaved overlay
    /// and marks the configuration dirty; edits go through the returned
    /// [`ConfList`]'s mutators.
    pub fn list_mut(&mut self, name: &str) -> Result<ConfList<'_>, ConfigError> {
        let (canonical, kind, current) = {
            let entry = self.entry(name)?;
            (entry.canonical.clone(), entry.kind, entry.value.clone())
        };
        if !kind.is_list() {
            return Err(ConfigError::NotAList(canonical));
        }
        let slot = self.unsaved.entry(canonical.clone()).or_insert(current);
        match slot {
            ConfValue::List(items) => Ok(ConfList { items }),
            _ => Err(ConfigError::NotAList(canonical)),
        }
    }

    /// The hidden services the daemon is configured with.
    pub fn hidden_services(&self) -> &[HiddenService] {
        &self.hidden_services
    }

    /// Add a hidden service; it is pushed to the daemon on the next
    /// save.
    pub fn add_hidden_service(&mut self, mut service: HiddenService) {
        service.attach(Arc::clone(&self.hs_dirty));
        self.hidden_services.push(service);
        self.hs_dirty.store(true, Ordering::Relaxed);
    }

    /// Remove the hidden service rooted at `dir`, if there is one.
    pub fn remove_hidden_service(&mut self, dir: &str) -> Option<HiddenService> {
        let index = self.hidden_services.iter().position(|hs| hs.dir() == dir)?;
        self.hs_dirty.store(true, Ordering::Relaxed);
        Some(self.hidden_services.remove(index))
    }

    /// Mutable access to the hidden service rooted at `dir`.
    ///
    /// Changes made through the returned reference mark the
    /// configuration dirty via the service's own mutators.
    pub fn hidden_service_mut(&mut self, dir: &str) -> Option<&mut HiddenService> {
        self.hidden_services.iter_mut().find(|hs| hs.dir() == dir)
    }

    /// True if there are changes the daemon has not seen.
    pub fn needs_save(&self) -> bool {
        !self.unsaved.is_empty() || self.hs_dirty.load(Ordering::Relaxed)
    }

    /// Push every unsaved change to the daemon in one `SETCONF`.
    ///
    /// The batch is atomic on the daemon side: either every pair is
    /// applied or none is.  On success the overlay is promoted into the
    /// cache and cleared; on failure it is retained unchanged, so the
    /// caller can correct and retry.
    ///
    /// This method takes `&mut self`, so overlapping saves on one mirror
    /// are not representable.
    pub async fn save(&mut self) -> Result<(), ConfigError> {
        if !self.needs_save() {
            return Ok(());
        }
        match self.conn.clone() {
            Some(conn) => {
                let pairs = self.assemble_setconf();
                let borrowed: Vec<(&str, &str)> = pairs
                    .iter()
                    .map(|(k, v)| (k.as_str(), v.as_str()))
                    .collect();
                conn.set_conf(&borrowed).await?;
                self.promote_unsaved();
            }
            None => {
                // No daemon to talk to; just fold the overlay in.
                self.promote_unsaved();
            }
        }
        Ok(())
    }

    /// Build the `(key, value)` pairs for a SETCONF of every unsaved
    /// change, hidden services expanded as their ordered group.
    fn assemble_setconf(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        for (canonical, value) in &self.unsaved {
            let kind = self.entries.get(&canonical.to_lowercase()).map(|e| e.kind);
            for wire in value.unparse(kind) {
                pairs.push((canonical.clone(), wire));
            }
        }
        if self.hs_dirty.load(Ordering::Relaxed) {
            for hs in &self.hidden_services {
                for (k, v) in hs.config_attributes() {
                    pairs.push((k.to_owned(), v));
                }
            }
        }
        pairs
    }

    /// Promote the overlay into the cache and clear the dirty state.
    fn promote_unsaved(&mut self) {
        let unsaved = std::mem::take(&mut self.unsaved);
        for (canonical, value) in unsaved {
            match self.entries.get_mut(&canonical.to_lowercase()) {
                Some(entry) => entry.value = value,
                None => {
                    let kind = inferred_kind(&value);
                    self.entries.insert(
                        canonical.to_lowercase(),
                        KeyEntry {
                            canonical,
                            kind,
                            value,
                        },
                    );
                }
            }
        }
        self.hs_dirty.store(false, Ordering::Relaxed);
    }

    /// Serialize the merged (cache plus overlay) view as torrc text:
    /// one `Key Value` line per setting, hidden services expanded.
    pub fn create_torrc(&self) -> String {
        let mut merged: BTreeMap<String, (Option<ConfType>, ConfValue)> = BTreeMap::new();
        for entry in self.entries.values() {
            merged.insert(
                entry.canonical.clone(),
                (Some(entry.kind), entry.value.clone()),
            );
        }
        for (canonical, value) in &self.unsaved {
            let kind = self.entries.get(&canonical.to_lowercase()).map(|e| e.kind);
            merged.insert(canonical.clone(), (kind, value.clone()));
        }

        let mut out = String::new();
        for (key, (kind, value)) in &merged {
            for wire in value.unparse(*kind) {
                out.push_str(key);
                out.push(' ');
                out.push_str(&wire);
                out.push('\n');
            }
        }
        for hs in &self.hidden_services {
            for (k, v) in hs.config_attributes() {
                out.push_str(k);
                out.push(' ');
                out.push_str(&v);
                out.push('\n');
            }
        }
        out
    }
}

impl Default for TorConfig {
    fn default() -> Self {
        TorConfig::new_detached()
    }
}

/// A borrowed view of a list-valued key's pending value, with mutators.
///
/// Created by [`TorConfig::list_mut`]; every mutation edits the unsaved
/// overlay, so the change reaches the daemon on the next save.
#[derive(Debug)]
pub struct ConfList<'a> {
    /// The overlay list being edited.
    items: &'a mut Vec<String>,
}

impl ConfList<'_> {
    /// Append an element.
    pub fn push<S: Into<String>>(&mut self, item: S) {
        self.items.push(item.into());
    }

    /// Replace the element at `index`.  Returns false if out of range.
    pub fn set<S: Into<String>>(&mut self, index: usize, item: S) -> bool {
        match self.items.get_mut(index) {
            Some(slot) => {
                *slot = item.into();
                true
            }
            None => false,
        }
    }

    /// Remove and return the element at `index`, if it exists.
    pub fn remove(&mut self, index: usize) -> Option<String> {
        if index < self.items.len() {
            Some(self.items.remove(index))
        } else {
            None
        }
    }

    /// The number of elements.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True if there are no elements.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterate over the elements.
    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.items.iter()
    }
}

/// Case-insensitive lookup into a reply map.
fn lookup_ci<'a, V>(map: &'a HashMap<String, V>, name: &str) -> Option<&'a V> {
    map.get(name)
        .or_else(|| {
            map.iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v)
        })
}

/// Attach a key name to a validation error produced by a bare parser.
fn name_error(e: ConfigError, name: &str) -> ConfigError {
    match e {
        ConfigError::Validation { reason, .. } => ConfigError::Validation {
            key: name.to_owned(),
            reason,
        },
        other => other,
    }
}

/// Guess a type tag for a value stored without a schema.
fn inferred_kind(value: &ConfValue) -> ConfType {
    match value {
        ConfValue::Bool(_) => ConfType::Boolean,
        ConfValue::Int(_) => ConfType::Integer,
        ConfValue::Float(_) => ConfType::Float,
        ConfValue::Str(_) => ConfType::String,
        ConfValue::List(_) => ConfType::LineList,
    }
}
