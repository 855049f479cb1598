//! Adaptor-side helper for announcing property changes.
//!
//! Services exposing properties are expected to emit the standard
//! `org.freedesktop.DBus.Properties.PropertiesChanged` signal whenever a
//! value changes; caches on the client side rely on it. These helpers build
//! and send that signal with an empty invalidated-properties list.

use crate::error::BusError;
use crate::target::Bus;
use crate::value::{PropertyMap, Value};

/// Emit `PropertiesChanged` for (`path`, `interface`) with the given changed
/// properties.
pub async fn emit_properties_changed(
    bus: &Bus,
    path: &str,
    interface: &str,
    changed: PropertyMap,
) -> Result<(), BusError> {
    bus.transport()
        .emit_properties_changed(path, interface, changed)
        .await
}

/// Emit `PropertiesChanged` for a single property.
pub async fn emit_property_changed(
    bus: &Bus,
    path: &str,
    interface: &str,
    property: &str,
    value: impl Into<Value>,
) -> Result<(), BusError> {
    let mut changed = PropertyMap::new();
    changed.insert(property.to_string(), value.into());
    emit_properties_changed(bus, path, interface, changed).await
}
