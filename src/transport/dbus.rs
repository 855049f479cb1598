//! zbus-backed transport for the session and system buses.
//!
//! Connections are established lazily, on the worker thread, the first time a
//! backend needs the bus. Client threads never touch the wire.

use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use zbus::zvariant;
use zbus::Connection;

use super::{BusTransport, OwnerChange, OwnerStream, SignalStream};
use super::{PROPERTIES_CHANGED, PROPERTIES_INTERFACE};
use crate::error::{BusError, ErrorKind};
use crate::target::Target;
use crate::value::{PropertyMap, Value};

#[derive(Debug, Clone, Copy)]
enum BusKind {
    Session,
    System,
}

/// Transport over a real D-Bus connection.
#[derive(Debug)]
pub struct ZbusTransport {
    kind: BusKind,
    conn: tokio::sync::OnceCell<Connection>,
}

impl ZbusTransport {
    pub fn session() -> Arc<Self> {
        Arc::new(Self {
            kind: BusKind::Session,
            conn: tokio::sync::OnceCell::new(),
        })
    }

    pub fn system() -> Arc<Self> {
        Arc::new(Self {
            kind: BusKind::System,
            conn: tokio::sync::OnceCell::new(),
        })
    }

    async fn connection(&self) -> Result<&Connection, BusError> {
        self.conn
            .get_or_try_init(|| async {
                match self.kind {
                    BusKind::Session => Connection::session().await,
                    BusKind::System => Connection::system().await,
                }
            })
            .await
            .map_err(map_zbus_error)
    }
}

#[async_trait]
impl BusTransport for ZbusTransport {
    fn id(&self) -> &str {
        match self.kind {
            BusKind::Session => "session",
            BusKind::System => "system",
        }
    }

    async fn get_all(&self, target: &Target) -> Result<PropertyMap, BusError> {
        let conn = self.connection().await?;
        let reply = conn
            .call_method(
                Some(target.service()),
                target.path(),
                Some(PROPERTIES_INTERFACE),
                "GetAll",
                &(target.interface(),),
            )
            .await
            .map_err(map_zbus_error)?;
        let body = reply.body();
        let raw: HashMap<String, zvariant::Value<'_>> =
            body.deserialize().map_err(map_zvariant_error)?;
        Ok(from_wire_map(target, raw))
    }

    async fn set(&self, target: &Target, property: &str, value: Value) -> Result<(), BusError> {
        let conn = self.connection().await?;
        let wire = to_wire_variant(&value)?;
        conn.call_method(
            Some(target.service()),
            target.path(),
            Some(PROPERTIES_INTERFACE),
            "Set",
            &(target.interface(), property, wire),
        )
        .await
        .map_err(map_zbus_error)?;
        Ok(())
    }

    async fn properties_changed(&self, target: &Target) -> Result<SignalStream, BusError> {
        let conn = self.connection().await?;
        let rule = zbus::MatchRule::builder()
            .msg_type(zbus::message::Type::Signal)
            .sender(target.service())
            .map_err(map_zbus_error)?
            .path(target.path())
            .map_err(map_zbus_error)?
            .interface(PROPERTIES_INTERFACE)
            .map_err(map_zbus_error)?
            .member(PROPERTIES_CHANGED)
            .map_err(map_zbus_error)?
            .arg(0, target.interface())
            .map_err(map_zbus_error)?
            .build();
        let stream = zbus::MessageStream::for_match_rule(rule, conn, None)
            .await
            .map_err(map_zbus_error)?;

        let target = target.clone();
        Ok(stream
            .filter_map(move |msg| {
                let changed = msg.ok().and_then(|msg| parse_properties_changed(&target, &msg));
                async move { changed }
            })
            .boxed())
    }

    async fn owner_changes(&self, service: &str) -> Result<OwnerStream, BusError> {
        let conn = self.connection().await?;
        let proxy = zbus::fdo::DBusProxy::new(conn)
            .await
            .map_err(map_zbus_error)?;
        let stream = proxy
            .receive_name_owner_changed()
            .await
            .map_err(map_zbus_error)?;

        let service = service.to_string();
        Ok(stream
            .filter_map(move |signal| {
                let change = signal.args().ok().and_then(|args| {
                    if args.name().as_str() != service {
                        return None;
                    }
                    Some(OwnerChange {
                        new_owner: args.new_owner().as_ref().map(|name| name.to_string()),
                    })
                });
                async move { change }
            })
            .boxed())
    }

    async fn emit_properties_changed(
        &self,
        path: &str,
        interface: &str,
        changed: PropertyMap,
    ) -> Result<(), BusError> {
        let conn = self.connection().await?;
        let mut wire = HashMap::with_capacity(changed.len());
        for (name, value) in &changed {
            wire.insert(name.as_str(), to_wire_variant(value)?);
        }
        conn.emit_signal(
            None::<&str>,
            path,
            PROPERTIES_INTERFACE,
            PROPERTIES_CHANGED,
            &(interface, wire, Vec::<String>::new()),
        )
        .await
        .map_err(map_zbus_error)?;
        Ok(())
    }
}

fn parse_properties_changed(target: &Target, msg: &zbus::Message) -> Option<PropertyMap> {
    let body = msg.body();
    let (interface, changed, _invalidated): (
        String,
        HashMap<String, zvariant::Value<'_>>,
        Vec<String>,
    ) = body.deserialize().ok()?;
    if interface != target.interface() {
        return None;
    }
    Some(from_wire_map(target, changed))
}

fn map_zbus_error(err: zbus::Error) -> BusError {
    match err {
        zbus::Error::MethodError(name, text, _) => {
            BusError::from_dbus_name(name.as_str(), text.unwrap_or_default())
        }
        zbus::Error::FDO(err) => map_fdo_error(*err),
        other => BusError::new(ErrorKind::Other, other.to_string()),
    }
}

fn map_fdo_error(err: zbus::fdo::Error) -> BusError {
    use zbus::fdo::Error as Fdo;
    match err {
        Fdo::ServiceUnknown(msg) => BusError::new(ErrorKind::ServiceUnknown, msg),
        Fdo::UnknownObject(msg) => BusError::new(ErrorKind::UnknownObject, msg),
        Fdo::UnknownInterface(msg) => BusError::new(ErrorKind::UnknownInterface, msg),
        Fdo::InvalidArgs(msg) => BusError::new(ErrorKind::InvalidArgs, msg),
        other => BusError::new(ErrorKind::Other, other.to_string()),
    }
}

fn map_zvariant_error(err: zbus::Error) -> BusError {
    BusError::new(ErrorKind::Other, format!("malformed reply: {err}"))
}

fn from_wire_map(target: &Target, raw: HashMap<String, zvariant::Value<'_>>) -> PropertyMap {
    let mut map = PropertyMap::new();
    for (name, value) in raw {
        match from_wire(&value) {
            Some(value) => {
                map.insert(name, value);
            }
            None => {
                warn!("skipping property {name:?} of {target}: unrepresentable value");
            }
        }
    }
    map
}

fn from_wire(value: &zvariant::Value<'_>) -> Option<Value> {
    use zvariant::Value as Wire;
    Some(match value {
        Wire::Bool(v) => Value::Bool(*v),
        Wire::U8(v) => Value::U8(*v),
        Wire::I16(v) => Value::I16(*v),
        Wire::U16(v) => Value::U16(*v),
        Wire::I32(v) => Value::I32(*v),
        Wire::U32(v) => Value::U32(*v),
        Wire::I64(v) => Value::I64(*v),
        Wire::U64(v) => Value::U64(*v),
        Wire::F64(v) => Value::F64(*v),
        Wire::Str(v) => Value::Str(v.to_string()),
        Wire::Signature(v) => Value::Signature(v.to_string()),
        Wire::ObjectPath(v) => Value::ObjectPath(v.to_string()),
        Wire::Value(inner) => Value::Variant(Box::new(from_wire(inner)?)),
        Wire::Array(items) => Value::Array(
            items
                .iter()
                .map(from_wire)
                .collect::<Option<Vec<_>>>()?,
        ),
        Wire::Dict(entries) => Value::Dict(
            entries
                .iter()
                .map(|(k, v)| Some((from_wire(k)?, from_wire(v)?)))
                .collect::<Option<Vec<_>>>()?,
        ),
        Wire::Structure(fields) => Value::Struct(
            fields
                .fields()
                .iter()
                .map(from_wire)
                .collect::<Option<Vec<_>>>()?,
        ),
        _ => return None,
    })
}

/// Convert a value destined for a variant-typed argument. A pre-wrapped
/// [`Value::Variant`] contributes its inner value, so the wire carries a
/// single variant layer.
fn to_wire_variant(value: &Value) -> Result<zvariant::Value<'static>, BusError> {
    let value = match value {
        Value::Variant(inner) => inner,
        other => other,
    };
    to_wire(value)
}

fn to_wire(value: &Value) -> Result<zvariant::Value<'static>, BusError> {
    use zvariant::Value as Wire;
    Ok(match value {
        Value::Bool(v) => Wire::Bool(*v),
        Value::U8(v) => Wire::U8(*v),
        Value::I16(v) => Wire::I16(*v),
        Value::U16(v) => Wire::U16(*v),
        Value::I32(v) => Wire::I32(*v),
        Value::U32(v) => Wire::U32(*v),
        Value::I64(v) => Wire::I64(*v),
        Value::U64(v) => Wire::U64(*v),
        Value::F64(v) => Wire::F64(*v),
        Value::Str(v) => Wire::from(v.clone()),
        Value::ObjectPath(v) => Wire::ObjectPath(
            zvariant::ObjectPath::try_from(v.clone())
                .map_err(|err| BusError::new(ErrorKind::InvalidArgs, err.to_string()))?,
        ),
        Value::Signature(v) => Wire::Signature(
            zvariant::Signature::try_from(v.as_str())
                .map_err(|err| BusError::new(ErrorKind::InvalidArgs, err.to_string()))?,
        ),
        Value::Variant(inner) => Wire::Value(Box::new(to_wire(inner)?)),
        Value::Array(items) => {
            let signature = match items.first() {
                Some(first) => wire_signature(first)?,
                None => {
                    return Err(BusError::new(
                        ErrorKind::InvalidArgs,
                        "cannot infer the element type of an empty array",
                    ))
                }
            };
            let signature = parse_signature(&signature)?;
            let mut array = zvariant::Array::new(&signature);
            for item in items {
                array
                    .append(to_wire(item)?)
                    .map_err(|err| BusError::new(ErrorKind::InvalidArgs, err.to_string()))?;
            }
            Wire::Array(array)
        }
        Value::Dict(entries) => {
            let (key_sig, value_sig) = match entries.first() {
                Some((k, v)) => (wire_signature(k)?, wire_signature(v)?),
                None => {
                    return Err(BusError::new(
                        ErrorKind::InvalidArgs,
                        "cannot infer the entry type of an empty dictionary",
                    ))
                }
            };
            let key_sig = parse_signature(&key_sig)?;
            let value_sig = parse_signature(&value_sig)?;
            let mut dict = zvariant::Dict::new(&key_sig, &value_sig);
            for (k, v) in entries {
                dict.append(to_wire(k)?, to_wire(v)?)
                    .map_err(|err| BusError::new(ErrorKind::InvalidArgs, err.to_string()))?;
            }
            Wire::Dict(dict)
        }
        Value::Struct(_) => {
            return Err(BusError::new(
                ErrorKind::InvalidArgs,
                "struct values cannot be sent",
            ))
        }
    })
}

fn parse_signature(signature: &str) -> Result<zvariant::Signature, BusError> {
    zvariant::Signature::try_from(signature)
        .map_err(|err| BusError::new(ErrorKind::InvalidArgs, err.to_string()))
}

fn wire_signature(value: &Value) -> Result<String, BusError> {
    Ok(match value {
        Value::Bool(_) => "b".to_string(),
        Value::U8(_) => "y".to_string(),
        Value::I16(_) => "n".to_string(),
        Value::U16(_) => "q".to_string(),
        Value::I32(_) => "i".to_string(),
        Value::U32(_) => "u".to_string(),
        Value::I64(_) => "x".to_string(),
        Value::U64(_) => "t".to_string(),
        Value::F64(_) => "d".to_string(),
        Value::Str(_) => "s".to_string(),
        Value::ObjectPath(_) => "o".to_string(),
        Value::Signature(_) => "g".to_string(),
        Value::Variant(_) => "v".to_string(),
        Value::Array(items) => match items.first() {
            Some(first) => format!("a{}", wire_signature(first)?),
            None => {
                return Err(BusError::new(
                    ErrorKind::InvalidArgs,
                    "cannot infer the element type of an empty array",
                ))
            }
        },
        Value::Dict(entries) => match entries.first() {
            Some((k, v)) => format!("a{{{}{}}}", wire_signature(k)?, wire_signature(v)?),
            None => {
                return Err(BusError::new(
                    ErrorKind::InvalidArgs,
                    "cannot infer the entry type of an empty dictionary",
                ))
            }
        },
        Value::Struct(fields) => {
            let mut sig = String::from("(");
            for field in fields {
                sig.push_str(&wire_signature(field)?);
            }
            sig.push(')');
            sig
        }
    })
}
