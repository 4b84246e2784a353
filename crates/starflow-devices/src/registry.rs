/*!
 * Device registry for Starflow.
 *
 * The registry is an explicit object owned by the application. Attaching a
 * device hands ownership of its controller to the registry; detaching drops
 * it, which stops the controller's background loops.
 */
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

use starflow_core::types::{Id, Value};

use crate::error::{DeviceError, Result};

/// Status summary of one attached device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStatus {
    /// Display name
    pub name: String,
    /// Kind tag (`dome`, `focuser`, `ror`, `mount`, ...)
    pub kind: String,
    /// Whether the device answered its last poll or exchange
    pub online: bool,
    /// Kind specific details
    pub detail: BTreeMap<String, Value>,
}

/// Something the registry can own and report on
pub trait RegisteredDevice: Send + Sync + Debug {
    /// Display name
    fn name(&self) -> &str;

    /// Kind tag
    fn kind(&self) -> &str;

    /// Current status summary
    fn status(&self) -> DeviceStatus;
}

/// Event types for the device registry
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    /// A device was attached
    Attached {
        /// Registry ID
        id: Id,
        /// Display name
        name: String,
    },
    /// A device was detached
    Detached(Id),
    /// A device went online or offline
    OnlineChanged {
        /// Registry ID
        id: Id,
        /// New online state
        online: bool,
    },
}

/// Publishes online transitions for one attached device
#[derive(Debug, Clone)]
pub struct RegistryNotifier {
    id: Id,
    sender: broadcast::Sender<RegistryEvent>,
}

impl RegistryNotifier {
    /// A notifier whose events nobody receives
    pub fn detached() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self { id: Id::new(), sender }
    }

    /// The device this notifier reports for
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Announce an online state change
    pub fn online_changed(&self, online: bool) {
        let _ = self.sender.send(RegistryEvent::OnlineChanged {
            id: self.id.clone(),
            online,
        });
    }
}

/// Device registry
#[derive(Debug)]
pub struct DeviceRegistry {
    devices: RwLock<BTreeMap<Id, Arc<dyn RegisteredDevice>>>,
    event_sender: broadcast::Sender<RegistryEvent>,
}

impl DeviceRegistry {
    /// Create a new device registry
    pub fn new() -> Self {
        let (event_sender, _) = broadcast::channel(100);
        Self {
            devices: RwLock::new(BTreeMap::new()),
            event_sender,
        }
    }

    /// Reserve an ID and a notifier before the device exists
    pub fn reserve(&self) -> RegistryNotifier {
        RegistryNotifier {
            id: Id::new(),
            sender: self.event_sender.clone(),
        }
    }

    /// Attach a device under a reserved ID
    pub fn attach(&self, id: Id, device: Arc<dyn RegisteredDevice>) -> Result<()> {
        let name = device.name().to_string();
        let mut devices = self.devices.write().map_err(|_| {
            DeviceError::Core("Failed to acquire write lock on device registry".to_string())
        })?;

        if devices.contains_key(&id) {
            return Err(DeviceError::configuration(format!(
                "Device with ID {} already attached",
                id
            )));
        }
        if devices.values().any(|d| d.name() == name) {
            return Err(DeviceError::configuration(format!(
                "Device named {} already attached",
                name
            )));
        }

        devices.insert(id.clone(), device);
        let _ = self.event_sender.send(RegistryEvent::Attached {
            id: id.clone(),
            name: name.clone(),
        });
        info!(%id, %name, "Device attached");
        Ok(())
    }

    /// Detach a device and hand back ownership
    pub fn detach(&self, id: &Id) -> Result<Arc<dyn RegisteredDevice>> {
        let mut devices = self.devices.write().map_err(|_| {
            DeviceError::Core("Failed to acquire write lock on device registry".to_string())
        })?;

        let device = devices
            .remove(id)
            .ok_or_else(|| DeviceError::configuration(format!("Device with ID {} not attached", id)))?;

        let _ = self.event_sender.send(RegistryEvent::Detached(id.clone()));
        debug!(%id, "Device detached");
        Ok(device)
    }

    /// Find a device by ID
    pub fn get(&self, id: &Id) -> Option<Arc<dyn RegisteredDevice>> {
        self.devices.read().ok()?.get(id).cloned()
    }

    /// Find a device by display name
    pub fn find_by_name(&self, name: &str) -> Option<(Id, Arc<dyn RegisteredDevice>)> {
        self.devices
            .read()
            .ok()?
            .iter()
            .find(|(_, device)| device.name() == name)
            .map(|(id, device)| (id.clone(), device.clone()))
    }

    /// Status of every attached device
    pub fn statuses(&self) -> Vec<(Id, DeviceStatus)> {
        match self.devices.read() {
            Ok(devices) => devices
                .iter()
                .map(|(id, device)| (id.clone(), device.status()))
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Detach everything; returns how many devices were dropped
    pub fn clear(&self) -> usize {
        let drained = match self.devices.write() {
            Ok(mut devices) => std::mem::take(&mut *devices),
            Err(_) => return 0,
        };
        for id in drained.keys() {
            let _ = self.event_sender.send(RegistryEvent::Detached(id.clone()));
        }
        drained.len()
    }

    /// Number of attached devices
    pub fn len(&self) -> usize {
        self.devices.read().map(|d| d.len()).unwrap_or(0)
    }

    /// Whether nothing is attached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A shared device registry that can be cloned
#[derive(Debug, Clone, Default)]
pub struct SharedDeviceRegistry(Arc<DeviceRegistry>);

impl SharedDeviceRegistry {
    /// Create a new shared device registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a reference to the device registry
    pub fn registry(&self) -> &DeviceRegistry {
        &self.0
    }
}

impl AsRef<DeviceRegistry> for SharedDeviceRegistry {
    fn as_ref(&self) -> &DeviceRegistry {
        self.registry()
    }
}
