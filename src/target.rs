//! Target of a D-Bus message: bus + service + object path + interface.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};

use crate::transport::dbus::ZbusTransport;
use crate::transport::BusTransport;

/// A cheap, cloneable handle to a bus connection.
///
/// Two `Bus` handles compare equal when they refer to the same underlying
/// transport, identified by [`Bus::id`]. The well-known buses are process-wide
/// singletons that connect lazily on the worker thread, so obtaining a handle
/// never performs I/O.
#[derive(Clone)]
pub struct Bus {
    transport: Arc<dyn BusTransport>,
}

impl Bus {
    /// Wrap a transport implementation in a bus handle.
    pub fn new(transport: Arc<dyn BusTransport>) -> Self {
        Self { transport }
    }

    /// The per-user session bus.
    pub fn session() -> Self {
        static SESSION: OnceLock<Bus> = OnceLock::new();
        SESSION
            .get_or_init(|| Bus::new(ZbusTransport::session()))
            .clone()
    }

    /// The system bus.
    pub fn system() -> Self {
        static SYSTEM: OnceLock<Bus> = OnceLock::new();
        SYSTEM
            .get_or_init(|| Bus::new(ZbusTransport::system()))
            .clone()
    }

    /// Identity string of the underlying transport (`session`, `system`, or a
    /// transport-specific name). Bus equality and hashing use this.
    pub fn id(&self) -> &str {
        self.transport.id()
    }

    pub(crate) fn transport(&self) -> &Arc<dyn BusTransport> {
        &self.transport
    }
}

impl PartialEq for Bus {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Bus {}

impl Hash for Bus {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Bus").field(&self.id()).finish()
    }
}

/// The target of a D-Bus message.
///
/// An immutable tuple of (bus, service, path, interface). Comparable,
/// hashable, and usable as a map key; acts as the identity of a cached
/// property set.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Target {
    bus: Bus,
    service: String,
    path: String,
    interface: String,
}

impl Target {
    /// Target on an explicit bus.
    pub fn new(
        bus: Bus,
        service: impl Into<String>,
        path: impl Into<String>,
        interface: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            service: service.into(),
            path: path.into(),
            interface: interface.into(),
        }
    }

    /// Target on the session bus.
    pub fn session(
        service: impl Into<String>,
        path: impl Into<String>,
        interface: impl Into<String>,
    ) -> Self {
        Self::new(Bus::session(), service, path, interface)
    }

    /// True when service, path, and interface are all non-empty.
    pub fn is_valid(&self) -> bool {
        !self.service.is_empty() && !self.path.is_empty() && !self.interface.is_empty()
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// A new target for `path` with the same bus, service, and interface.
    pub fn with_path(&self, path: impl Into<String>) -> Self {
        Self {
            bus: self.bus.clone(),
            service: self.service.clone(),
            path: path.into(),
            interface: self.interface.clone(),
        }
    }

    /// A new target for `interface` with the same bus, service, and path.
    pub fn with_interface(&self, interface: impl Into<String>) -> Self {
        Self {
            bus: self.bus.clone(),
            service: self.service.clone(),
            path: self.path.clone(),
            interface: interface.into(),
        }
    }

    /// A new target for `path` and `interface` with the same bus and service.
    pub fn with(&self, path: impl Into<String>, interface: impl Into<String>) -> Self {
        Self {
            bus: self.bus.clone(),
            service: self.service.clone(),
            path: path.into(),
            interface: interface.into(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(
                f,
                "DBus({}, {}, {}, {})",
                self.bus.id(),
                self.service,
                self.path,
                self.interface
            )
        } else {
            write!(f, "DBus(invalid)")
        }
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
