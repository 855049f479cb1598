//! Bus transport abstraction.
//!
//! The cache core never talks wire protocol directly; everything it needs
//! from D-Bus is behind [`BusTransport`]: the `GetAll`/`Set` property calls,
//! a `PropertiesChanged` subscription, and a service-owner watch. The real
//! implementation is [`dbus::ZbusTransport`]; [`mock::MockBus`] provides an
//! in-process transport for tests.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::fmt;

use crate::error::BusError;
use crate::target::Target;
use crate::value::{PropertyMap, Value};

pub mod dbus;
pub mod mock;

/// Well-known interface hosting the property operations.
pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

/// Name of the property-change signal.
pub const PROPERTIES_CHANGED: &str = "PropertiesChanged";

/// One transition of a service name's ownership.
///
/// `new_owner` is `None` when the name lost its owner (the service
/// disconnected or was never started).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerChange {
    pub new_owner: Option<String>,
}

/// Stream of changed-property payloads from `PropertiesChanged` signals.
pub type SignalStream = BoxStream<'static, PropertyMap>;

/// Stream of service-owner transitions.
pub type OwnerStream = BoxStream<'static, OwnerChange>;

/// The bus operations the cache core depends on.
///
/// All calls are made from the worker thread; implementations may block the
/// worker task but must never assume a particular client thread.
#[async_trait]
pub trait BusTransport: Send + Sync + fmt::Debug {
    /// Stable identity of this transport, used for [`Bus`](crate::Bus)
    /// equality and hashing.
    fn id(&self) -> &str;

    /// `org.freedesktop.DBus.Properties.GetAll` on the target.
    async fn get_all(&self, target: &Target) -> Result<PropertyMap, BusError>;

    /// `org.freedesktop.DBus.Properties.Set` on the target. The value is sent
    /// as a D-Bus variant; a [`Value::Variant`] is sent as a single variant,
    /// never double-wrapped.
    async fn set(&self, target: &Target, property: &str, value: Value) -> Result<(), BusError>;

    /// Subscribe to `PropertiesChanged` signals for the target's (service,
    /// path), filtered to its interface. Yields the changed-property map of
    /// each signal.
    async fn properties_changed(&self, target: &Target) -> Result<SignalStream, BusError>;

    /// Watch ownership of a service name.
    async fn owner_changes(&self, service: &str) -> Result<OwnerStream, BusError>;

    /// Adaptor-side helper: emit a `PropertiesChanged` signal for (path,
    /// interface) with the given changed map and an empty invalidated list.
    async fn emit_properties_changed(
        &self,
        path: &str,
        interface: &str,
        changed: PropertyMap,
    ) -> Result<(), BusError>;
}
