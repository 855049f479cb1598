//! Error type surfaced by the cache.

use thiserror::Error;

/// Broad classification of a D-Bus failure.
///
/// The cache reacts to the *kind* of an error (for example, retrying when a
/// service reappears after `ServiceUnknown`); the message is informational.
/// Error-change notifications fire when the kind changes, not the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The service name has no owner on the bus.
    ServiceUnknown,
    /// The object path is not registered by the service.
    UnknownObject,
    /// The object exists but does not implement the interface.
    UnknownInterface,
    /// Malformed call arguments (also used for invalid targets).
    InvalidArgs,
    /// Any other transport or peer error, passed through opaquely.
    Other,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::ServiceUnknown => "ServiceUnknown",
            ErrorKind::UnknownObject => "UnknownObject",
            ErrorKind::UnknownInterface => "UnknownInterface",
            ErrorKind::InvalidArgs => "InvalidArgs",
            ErrorKind::Other => "Other",
        };
        f.write_str(name)
    }
}

/// A D-Bus failure observed by the cache.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct BusError {
    kind: ErrorKind,
    message: String,
}

impl BusError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Classify a D-Bus error by its wire name
    /// (e.g. `org.freedesktop.DBus.Error.ServiceUnknown`).
    pub fn from_dbus_name(name: &str, message: impl Into<String>) -> Self {
        let kind = match name {
            "org.freedesktop.DBus.Error.ServiceUnknown" => ErrorKind::ServiceUnknown,
            "org.freedesktop.DBus.Error.UnknownObject" => ErrorKind::UnknownObject,
            "org.freedesktop.DBus.Error.UnknownInterface" => ErrorKind::UnknownInterface,
            "org.freedesktop.DBus.Error.InvalidArgs" => ErrorKind::InvalidArgs,
            _ => ErrorKind::Other,
        };
        let mut message = message.into();
        if kind == ErrorKind::Other {
            message = format!("{name}: {message}");
        }
        Self { kind, message }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}
