//! Control channel to the mock backend.
//!
//! [`MockControl`] is the seam between the registry and the backend process.
//! [`DbusMockControl`] drives python-dbusmock over its
//! `org.freedesktop.DBus.Mock` interface.

use std::collections::HashMap;

use async_trait::async_trait;
use bustest_core::Value;
use zbus::zvariant::{self, OwnedValue};

use super::wire::to_zvalue;
use crate::error::BusTestError;

/// Interface every dbusmock object exposes for runtime changes.
pub const MOCK_INTERFACE: &str = "org.freedesktop.DBus.Mock";

/// Main interface of the backend's root object.
pub const ROOT_INTERFACE: &str = "org.bustest.Mock";

/// One recorded call to a mocked method.
#[derive(Debug, PartialEq)]
pub struct MethodCall {
    /// Seconds since the epoch, as recorded by the backend.
    pub timestamp: u64,
    pub args: Vec<OwnedValue>,
}

/// Operations the registry needs from a live backend.
#[async_trait]
pub trait MockControl: Send + Sync {
    /// Create an (empty) object at `path` whose main interface is `interface`.
    async fn add_object(&self, path: &str, interface: &str) -> Result<(), BusTestError>;

    async fn add_property(
        &self,
        path: &str,
        interface: &str,
        name: &str,
        value: &Value,
    ) -> Result<(), BusTestError>;

    async fn add_method(
        &self,
        path: &str,
        interface: &str,
        name: &str,
        in_signature: &str,
        out_signature: &str,
        behavior: &str,
    ) -> Result<(), BusTestError>;

    async fn update_property(
        &self,
        path: &str,
        interface: &str,
        name: &str,
        value: &Value,
    ) -> Result<(), BusTestError>;

    async fn emit_signal(
        &self,
        path: &str,
        interface: &str,
        name: &str,
        signature: &str,
        args: &[Value],
    ) -> Result<(), BusTestError>;

    async fn method_calls(&self, path: &str, method: &str)
    -> Result<Vec<MethodCall>, BusTestError>;

    async fn clear_calls(&self, path: &str) -> Result<(), BusTestError>;
}

/// [`MockControl`] over a bus connection to a python-dbusmock process.
#[derive(Debug, Clone)]
pub struct DbusMockControl {
    connection: zbus::Connection,
    destination: String,
}

impl DbusMockControl {
    pub fn new(connection: zbus::Connection, destination: impl Into<String>) -> Self {
        Self {
            connection,
            destination: destination.into(),
        }
    }

    async fn call<B>(
        &self,
        path: &str,
        method: &'static str,
        body: &B,
    ) -> Result<zbus::Message, BusTestError>
    where
        B: serde::Serialize + zvariant::DynamicType,
    {
        self.connection
            .call_method(
                Some(self.destination.as_str()),
                path,
                Some(MOCK_INTERFACE),
                method,
                body,
            )
            .await
            .map_err(|e| remote_error(method, path, e))
    }
}

/// Backend replies map to `RemoteApplyFailed`; a vanished peer or a closed
/// connection maps to `BackendUnreachable`.
fn remote_error(method: &str, path: &str, err: zbus::Error) -> BusTestError {
    match &err {
        zbus::Error::MethodError(name, _, _)
            if name.as_str() != "org.freedesktop.DBus.Error.ServiceUnknown"
                && name.as_str() != "org.freedesktop.DBus.Error.NoReply" =>
        {
            BusTestError::RemoteApplyFailed {
                operation: format!("{method} on {path}"),
                reason: err.to_string(),
            }
        }
        zbus::Error::MethodError(..) | zbus::Error::InputOutput(_) => {
            BusTestError::BackendUnreachable(format!("{method} on {path}: {err}"))
        }
        _ => BusTestError::RemoteApplyFailed {
            operation: format!("{method} on {path}"),
            reason: err.to_string(),
        },
    }
}

fn convert(value: &Value) -> Result<zvariant::Value<'static>, BusTestError> {
    to_zvalue(value).map_err(|e| BusTestError::RemoteApplyFailed {
        operation: "encode value".to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl MockControl for DbusMockControl {
    async fn add_object(&self, path: &str, interface: &str) -> Result<(), BusTestError> {
        let properties: HashMap<String, zvariant::Value<'static>> = HashMap::new();
        let methods: Vec<(String, String, String, String)> = Vec::new();
        self.call("/", "AddObject", &(path, interface, properties, methods))
            .await?;
        Ok(())
    }

    async fn add_property(
        &self,
        path: &str,
        interface: &str,
        name: &str,
        value: &Value,
    ) -> Result<(), BusTestError> {
        let value = convert(value)?;
        self.call(path, "AddProperty", &(interface, name, value))
            .await?;
        Ok(())
    }

    async fn add_method(
        &self,
        path: &str,
        interface: &str,
        name: &str,
        in_signature: &str,
        out_signature: &str,
        behavior: &str,
    ) -> Result<(), BusTestError> {
        self.call(
            path,
            "AddMethod",
            &(interface, name, in_signature, out_signature, behavior),
        )
        .await?;
        Ok(())
    }

    async fn update_property(
        &self,
        path: &str,
        interface: &str,
        name: &str,
        value: &Value,
    ) -> Result<(), BusTestError> {
        let changed = HashMap::from([(name.to_string(), convert(value)?)]);
        self.call(path, "UpdateProperties", &(interface, changed))
            .await?;
        Ok(())
    }

    async fn emit_signal(
        &self,
        path: &str,
        interface: &str,
        name: &str,
        signature: &str,
        args: &[Value],
    ) -> Result<(), BusTestError> {
        let args = args
            .iter()
            .map(convert)
            .collect::<Result<Vec<_>, _>>()?;
        self.call(path, "EmitSignal", &(interface, name, signature, args))
            .await?;
        Ok(())
    }

    async fn method_calls(
        &self,
        path: &str,
        method: &str,
    ) -> Result<Vec<MethodCall>, BusTestError> {
        let reply = self.call(path, "GetMethodCalls", &(method,)).await?;
        let calls: Vec<(u64, Vec<OwnedValue>)> =
            reply
                .body()
                .deserialize()
                .map_err(|e| BusTestError::RemoteApplyFailed {
                    operation: format!("GetMethodCalls on {path}"),
                    reason: format!("unexpected reply: {e}"),
                })?;
        Ok(calls
            .into_iter()
            .map(|(timestamp, args)| MethodCall { timestamp, args })
            .collect())
    }

    async fn clear_calls(&self, path: &str) -> Result<(), BusTestError> {
        self.call(path, "ClearCalls", &()).await?;
        Ok(())
    }
}
