//! Paired Device Registry
//!
//! Durable store of established pairings: at most one outbound record and
//! any number of uniquely named inbound records.
//!
//! ## Consistency
//!
//! Every mutation reloads the stored snapshot, so changes made through
//! another handle on the same store are kept, and works on that copy. The
//! copy is saved to the [`RegistryStore`] first and only then swapped into
//! memory, so a failed save leaves both the stored and the in-memory view
//! unchanged. Writers are serialized; readers only take a short read lock and
//! never wait for storage I/O.

use crate::device::{validate_name, DeviceRole, PairedDevice};
use crate::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};

/// Everything the registry persists
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySnapshot {
    /// The desktop shared content is forwarded to
    #[serde(default)]
    pub outbound: Option<PairedDevice>,

    /// Devices allowed to send content here
    #[serde(default)]
    pub inbound: Vec<PairedDevice>,
}

impl RegistrySnapshot {
    fn inbound_position(&self, name: &str) -> Option<usize> {
        self.inbound.iter().position(|d| d.name == name)
    }
}

/// Which record to address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSelector {
    /// Inbound record with this exact name
    Inbound(String),
    /// The outbound record
    Outbound,
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSelector::Inbound(name) => write!(f, "inbound device '{}'", name),
            DeviceSelector::Outbound => write!(f, "outbound device"),
        }
    }
}

/// Persistence backend for the registry
pub trait RegistryStore: Send + Sync {
    /// Load the stored snapshot (empty if nothing was stored yet)
    fn load(&self) -> Result<RegistrySnapshot>;

    /// Durably replace the stored snapshot
    fn save(&self, snapshot: &RegistrySnapshot) -> Result<()>;
}

impl<S: RegistryStore + ?Sized> RegistryStore for Arc<S> {
    fn load(&self) -> Result<RegistrySnapshot> {
        (**self).load()
    }

    fn save(&self, snapshot: &RegistrySnapshot) -> Result<()> {
        (**self).save(snapshot)
    }
}

/// Pretty-printed JSON file, replaced atomically and durably on save
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "registry.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl RegistryStore for JsonFileStore {
    fn load(&self) -> Result<RegistrySnapshot> {
        if !self.path.exists() {
            debug!("No existing registry file at {:?}", self.path);
            return Ok(RegistrySnapshot::default());
        }

        let json = fs::read_to_string(&self.path)?;
        let snapshot: RegistrySnapshot = serde_json::from_str(&json)?;
        info!(
            "Loaded {} inbound device(s) from registry, outbound {}",
            snapshot.inbound.len(),
            if snapshot.outbound.is_some() { "paired" } else { "not paired" }
        );
        Ok(snapshot)
    }

    fn save(&self, snapshot: &RegistrySnapshot) -> Result<()> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)?;

        let json = serde_json::to_vec_pretty(snapshot)?;
        let temp = self.temp_path();

        if let Err(e) = write_synced(&temp, &json).and_then(|()| fs::rename(&temp, &self.path)) {
            warn!("Failed to save device registry to {:?}: {}", self.path, e);
            if let Err(cleanup) = fs::remove_file(&temp) {
                debug!("Could not remove {:?}: {}", temp, cleanup);
            }
            return Err(e.into());
        }
        sync_dir(parent)?;

        debug!("Saved device registry to {:?}", self.path);
        Ok(())
    }
}

/// Write `bytes` to a new file at `path` and flush it to disk
fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// Persist a rename in `dir`
#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshot: Mutex<RegistrySnapshot>,
    fail_next_save: Mutex<bool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing snapshot
    pub fn with_snapshot(snapshot: RegistrySnapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
            fail_next_save: Mutex::new(false),
        }
    }

    /// Make the next [`RegistryStore::save`] fail with a storage error
    pub fn fail_next_save(&self) {
        if let Ok(mut flag) = self.fail_next_save.lock() {
            *flag = true;
        }
    }

    /// What was last saved
    pub fn stored(&self) -> RegistrySnapshot {
        self.snapshot
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

impl RegistryStore for MemoryStore {
    fn load(&self) -> Result<RegistrySnapshot> {
        Ok(self.stored())
    }

    fn save(&self, snapshot: &RegistrySnapshot) -> Result<()> {
        let mut fail = self
            .fail_next_save
            .lock()
            .map_err(|e| ProtocolError::Storage(format!("Failed to acquire store lock: {}", e)))?;
        if *fail {
            *fail = false;
            return Err(ProtocolError::Storage("Injected save failure".to_string()));
        }

        let mut stored = self
            .snapshot
            .lock()
            .map_err(|e| ProtocolError::Storage(format!("Failed to acquire store lock: {}", e)))?;
        *stored = snapshot.clone();
        Ok(())
    }
}

/// Registry of paired devices
pub struct DeviceRegistry {
    store: Box<dyn RegistryStore>,
    snapshot: RwLock<RegistrySnapshot>,
    writer: Mutex<()>,
}

impl DeviceRegistry {
    /// Open a registry, loading the stored snapshot
    pub fn open(store: impl RegistryStore + 'static) -> Result<Self> {
        let snapshot = store.load()?;
        Ok(Self {
            store: Box::new(store),
            snapshot: RwLock::new(snapshot),
            writer: Mutex::new(()),
        })
    }

    /// Empty registry backed by a [`MemoryStore`]
    pub fn in_memory() -> Self {
        Self {
            store: Box::new(MemoryStore::new()),
            snapshot: RwLock::new(RegistrySnapshot::default()),
            writer: Mutex::new(()),
        }
    }

    /// Set the outbound device, replacing any existing one
    ///
    /// Returns the replaced record. The name must match the device name
    /// pattern.
    pub fn upsert_outbound(&self, device: PairedDevice) -> Result<Option<PairedDevice>> {
        if device.role != DeviceRole::Outbound {
            return Err(ProtocolError::InvalidState {
                expected: DeviceRole::Outbound.to_string(),
                actual: device.role.to_string(),
            });
        }

        validate_name(&device.name)?;

        let name = device.name.clone();
        let previous = self.mutate(|snapshot| Ok(snapshot.outbound.replace(device)))?;

        match &previous {
            Some(old) => info!("Replaced outbound device '{}' with '{}'", old.name, name),
            None => info!("Paired outbound device '{}'", name),
        }
        Ok(previous)
    }

    /// Add an inbound device
    ///
    /// # Errors
    ///
    /// - `Validation` if the name does not match the device name pattern
    /// - `DuplicateName` if an inbound device with this exact name exists
    pub fn insert_inbound(&self, device: PairedDevice) -> Result<()> {
        if device.role != DeviceRole::Inbound {
            return Err(ProtocolError::InvalidState {
                expected: DeviceRole::Inbound.to_string(),
                actual: device.role.to_string(),
            });
        }
        validate_name(&device.name)?;

        let name = device.name.clone();
        self.mutate(|snapshot| {
            if snapshot.inbound_position(&device.name).is_some() {
                return Err(ProtocolError::DuplicateName(device.name.clone()));
            }
            snapshot.inbound.push(device);
            Ok(())
        })?;

        info!("Paired inbound device '{}'", name);
        Ok(())
    }

    /// Remove a record
    ///
    /// Returns the removed record, or `NotFound` if there was none.
    pub fn remove(&self, selector: &DeviceSelector) -> Result<PairedDevice> {
        let removed = self.mutate(|snapshot| {
            let removed = match selector {
                DeviceSelector::Outbound => snapshot.outbound.take(),
                DeviceSelector::Inbound(name) => snapshot
                    .inbound_position(name)
                    .map(|i| snapshot.inbound.remove(i)),
            };
            removed.ok_or_else(|| ProtocolError::NotFound(selector.to_string()))
        })?;

        info!("Unpaired {}", selector);
        Ok(removed)
    }

    /// Records with the given role
    pub fn list(&self, role: DeviceRole) -> Vec<PairedDevice> {
        let snapshot = self.read();
        match role {
            DeviceRole::Outbound => snapshot.outbound.iter().cloned().collect(),
            DeviceRole::Inbound => snapshot.inbound.clone(),
        }
    }

    /// The outbound device, if paired
    pub fn outbound(&self) -> Option<PairedDevice> {
        self.read().outbound.clone()
    }

    /// Inbound device with this exact name
    pub fn inbound(&self, name: &str) -> Option<PairedDevice> {
        self.read().inbound.iter().find(|d| d.name == name).cloned()
    }

    /// Check if a device with this role and name is paired
    pub fn is_paired(&self, role: DeviceRole, name: &str) -> bool {
        let snapshot = self.read();
        match role {
            DeviceRole::Outbound => snapshot.outbound.as_ref().is_some_and(|d| d.name == name),
            DeviceRole::Inbound => snapshot.inbound_position(name).is_some(),
        }
    }

    /// Copy of the whole registry
    pub fn snapshot(&self) -> RegistrySnapshot {
        self.read().clone()
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistrySnapshot> {
        // The snapshot is only ever replaced wholesale, so a poisoned lock
        // still guards a consistent value.
        self.snapshot.read().unwrap_or_else(|e| e.into_inner())
    }

    fn mutate<T>(&self, apply: impl FnOnce(&mut RegistrySnapshot) -> Result<T>) -> Result<T> {
        let _writer = self
            .writer
            .lock()
            .map_err(|e| ProtocolError::Storage(format!("Failed to acquire writer lock: {}", e)))?;

        let current = self.store.load()?;
        if current != *self.read() {
            debug!("Device registry changed in storage, refreshing before write");
            *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = current.clone();
        }

        let mut next = current;
        let out = apply(&mut next)?;

        if let Err(e) = self.store.save(&next) {
            warn!("Registry save failed, keeping previous state: {}", e);
            return Err(e);
        }

        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = next;
        Ok(out)
    }
}
