//! Declared shape of a mock task's objects.
//!
//! Declarations made while the backend is unreachable are committed locally
//! and queued. [`Registry::attach`] replays the queue once, in order, when
//! the backend comes up. After that every declaration goes straight to the
//! backend and is committed locally only if the backend accepts it.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use bustest_core::names::{validate_interface_name, validate_member_name, validate_object_path};
use bustest_core::{DataType, Signature, Value};
use indexmap::IndexMap;
use zbus::zvariant;

use super::control::{MethodCall, MockControl};
use super::wire::to_zvalue;
use crate::error::{BusTestError, ErrorKind, TaskFailure};

/// Handle to one (object path, interface) pair of a mock task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MockObject {
    path: String,
    interface: String,
}

impl MockObject {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }
}

impl std::fmt::Display for MockObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.path, self.interface)
    }
}

/// A declaration waiting for the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingOperation {
    AddProperty {
        object: MockObject,
        name: String,
        value: Value,
    },
    AddMethod {
        object: MockObject,
        name: String,
        in_signature: String,
        out_signature: String,
        behavior: String,
    },
    SetProperty {
        object: MockObject,
        name: String,
        value: Value,
    },
}

impl PendingOperation {
    pub fn object(&self) -> &MockObject {
        match self {
            Self::AddProperty { object, .. }
            | Self::AddMethod { object, .. }
            | Self::SetProperty { object, .. } => object,
        }
    }

    pub fn member(&self) -> &str {
        match self {
            Self::AddProperty { name, .. }
            | Self::AddMethod { name, .. }
            | Self::SetProperty { name, .. } => name,
        }
    }

    fn kind_str(&self) -> &'static str {
        match self {
            Self::AddProperty { .. } => "add_property",
            Self::AddMethod { .. } => "add_method",
            Self::SetProperty { .. } => "set_property",
        }
    }
}

impl std::fmt::Display for PendingOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} '{}' on {}", self.kind_str(), self.member(), self.object())
    }
}

#[derive(Debug)]
struct PropertyEntry {
    ty: DataType,
    value: Value,
}

#[derive(Debug)]
struct MethodEntry {
    in_signature: Signature,
}

#[derive(Debug)]
struct ObjectEntry {
    properties: IndexMap<String, PropertyEntry>,
    methods: IndexMap<String, MethodEntry>,
    consistent: bool,
}

impl Default for ObjectEntry {
    fn default() -> Self {
        Self {
            properties: IndexMap::new(),
            methods: IndexMap::new(),
            consistent: true,
        }
    }
}

impl ObjectEntry {
    fn ensure_free(&self, object: &MockObject, name: &str) -> Result<(), BusTestError> {
        if self.properties.contains_key(name) || self.methods.contains_key(name) {
            return Err(BusTestError::MemberExists {
                object: object.to_string(),
                member: name.to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct Registry {
    objects: IndexMap<MockObject, ObjectEntry>,
    pending: VecDeque<PendingOperation>,
    /// Paths known to exist on the backend.
    announced: HashSet<String>,
    flushed: bool,
    backend: Option<Arc<dyn MockControl>>,
    unreported: Option<TaskFailure>,
    lost: bool,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("objects", &self.objects.len())
            .field("pending", &self.pending.len())
            .field("flushed", &self.flushed)
            .field("attached", &self.backend.is_some())
            .field("lost", &self.lost)
            .finish()
    }
}

fn parse_type(signature: &str) -> Result<DataType, BusTestError> {
    signature
        .parse()
        .map_err(|source| BusTestError::InvalidSignature {
            signature: signature.to_string(),
            source,
        })
}

fn parse_signature(signature: &str) -> Result<Signature, BusTestError> {
    Signature::parse(signature).map_err(|source| BusTestError::InvalidSignature {
        signature: signature.to_string(),
        source,
    })
}

fn validate_all(values: &[Value]) -> Result<(), BusTestError> {
    values.iter().try_for_each(|value| Ok(value.validate()?))
}

impl Registry {
    pub(crate) fn new() -> Self {
        let mut registry = Self::default();
        // The backend's root object exists from the start.
        registry.announced.insert("/".to_string());
        registry
    }

    /// Look up or create the handle for `path` + `interface`.
    pub(crate) fn object(&mut self, path: &str, interface: &str) -> Result<MockObject, BusTestError> {
        validate_object_path(path)?;
        validate_interface_name(interface)?;
        let object = MockObject {
            path: path.to_string(),
            interface: interface.to_string(),
        };
        self.objects.entry(object.clone()).or_default();
        Ok(object)
    }

    pub(crate) async fn add_property(
        &mut self,
        object: &MockObject,
        name: &str,
        signature: &str,
        value: Value,
    ) -> Result<(), BusTestError> {
        self.check_usable()?;
        validate_member_name(name)?;
        let ty = parse_type(signature)?;
        self.entry(object).ensure_free(object, name)?;
        value.validate()?;
        value.check(&ty).map_err(|source| BusTestError::TypeMismatch {
            member: name.to_string(),
            source,
        })?;

        if let Some(backend) = self.backend.clone() {
            self.announce(backend.as_ref(), object).await?;
            backend
                .add_property(&object.path, &object.interface, name, &value)
                .await?;
            self.commit_property(object, name, ty, value);
        } else {
            self.commit_property(object, name, ty, value.clone());
            self.enqueue(PendingOperation::AddProperty {
                object: object.clone(),
                name: name.to_string(),
                value,
            });
        }
        Ok(())
    }

    pub(crate) async fn add_method(
        &mut self,
        object: &MockObject,
        name: &str,
        in_signature: &str,
        out_signature: &str,
        behavior: &str,
    ) -> Result<(), BusTestError> {
        self.check_usable()?;
        validate_member_name(name)?;
        let parsed_in = parse_signature(in_signature)?;
        parse_signature(out_signature)?;
        self.entry(object).ensure_free(object, name)?;

        if let Some(backend) = self.backend.clone() {
            self.announce(backend.as_ref(), object).await?;
            backend
                .add_method(
                    &object.path,
                    &object.interface,
                    name,
                    in_signature,
                    out_signature,
                    behavior,
                )
                .await?;
        } else {
            self.enqueue(PendingOperation::AddMethod {
                object: object.clone(),
                name: name.to_string(),
                in_signature: in_signature.to_string(),
                out_signature: out_signature.to_string(),
                behavior: behavior.to_string(),
            });
        }
        self.entry(object).methods.insert(
            name.to_string(),
            MethodEntry {
                in_signature: parsed_in,
            },
        );
        Ok(())
    }

    pub(crate) async fn set_property(
        &mut self,
        object: &MockObject,
        name: &str,
        value: Value,
    ) -> Result<(), BusTestError> {
        self.check_usable()?;
        let declared = self
            .objects
            .get(object)
            .and_then(|entry| entry.properties.get(name))
            .map(|property| property.ty.clone())
            .ok_or_else(|| BusTestError::NoSuchProperty {
                object: object.to_string(),
                property: name.to_string(),
            })?;
        value.validate()?;
        value
            .check(&declared)
            .map_err(|source| BusTestError::TypeMismatch {
                member: name.to_string(),
                source,
            })?;

        if let Some(backend) = self.backend.clone() {
            backend
                .update_property(&object.path, &object.interface, name, &value)
                .await?;
        } else {
            self.enqueue(PendingOperation::SetProperty {
                object: object.clone(),
                name: name.to_string(),
                value: value.clone(),
            });
        }
        if let Some(property) = self.entry(object).properties.get_mut(name) {
            property.value = value;
        }
        Ok(())
    }

    pub(crate) async fn emit_signal(
        &mut self,
        object: &MockObject,
        name: &str,
        signature: &str,
        args: &[Value],
    ) -> Result<(), BusTestError> {
        validate_member_name(name)?;
        let parsed = parse_signature(signature)?;
        validate_all(args)?;
        Value::check_all(args, &parsed).map_err(|source| BusTestError::TypeMismatch {
            member: name.to_string(),
            source,
        })?;
        let backend = self.live()?;
        self.announce(backend.as_ref(), object).await?;
        backend
            .emit_signal(&object.path, &object.interface, name, signature, args)
            .await
    }

    pub(crate) async fn method_calls(
        &mut self,
        object: &MockObject,
        method: &str,
    ) -> Result<Vec<MethodCall>, BusTestError> {
        let backend = self.live()?;
        backend.method_calls(&object.path, method).await
    }

    /// Whether `method` was called with exactly `args`.
    pub(crate) async fn check_method_call(
        &mut self,
        object: &MockObject,
        method: &str,
        args: &[Value],
    ) -> Result<bool, BusTestError> {
        validate_all(args)?;
        if let Some(declared) = self
            .objects
            .get(object)
            .and_then(|entry| entry.methods.get(method))
        {
            Value::check_all(args, &declared.in_signature).map_err(|source| {
                BusTestError::TypeMismatch {
                    member: method.to_string(),
                    source,
                }
            })?;
        }
        let expected = args
            .iter()
            .map(to_zvalue)
            .collect::<zvariant::Result<Vec<_>>>()
            .map_err(|e| BusTestError::RemoteApplyFailed {
                operation: "encode value".to_string(),
                reason: e.to_string(),
            })?;
        let calls = self.method_calls(object, method).await?;
        Ok(calls.iter().any(|call| {
            call.args.len() == expected.len()
                && call
                    .args
                    .iter()
                    .zip(&expected)
                    .all(|(got, want)| &**got == want)
        }))
    }

    pub(crate) async fn clear_method_calls(&mut self, object: &MockObject) -> Result<(), BusTestError> {
        let backend = self.live()?;
        backend.clear_calls(&object.path).await
    }

    pub(crate) fn property(&self, object: &MockObject, name: &str) -> Option<Value> {
        self.objects
            .get(object)
            .and_then(|entry| entry.properties.get(name))
            .map(|property| property.value.clone())
    }

    pub(crate) fn has_method(&self, object: &MockObject, name: &str) -> bool {
        self.objects
            .get(object)
            .is_some_and(|entry| entry.methods.contains_key(name))
    }

    pub(crate) fn is_consistent(&self, object: &MockObject) -> bool {
        self.objects.get(object).is_none_or(|entry| entry.consistent)
    }

    pub(crate) fn pending_operations(&self) -> Vec<PendingOperation> {
        self.pending.iter().cloned().collect()
    }

    /// Connect the backend and replay queued declarations in order.
    ///
    /// Runs at most once. Operations after a failed one on the same object
    /// are skipped. The first failure is returned and also kept for the next
    /// registry call to report.
    pub(crate) async fn attach(&mut self, backend: Arc<dyn MockControl>) -> Result<(), TaskFailure> {
        if self.flushed {
            return Ok(());
        }
        self.flushed = true;
        self.backend = Some(Arc::clone(&backend));

        let total = self.pending.len();
        let mut first_failure: Option<TaskFailure> = None;
        while let Some(op) = self.pending.pop_front() {
            if !self.is_consistent(op.object()) {
                tracing::debug!(operation = %op, "skipping operation on inconsistent object");
                continue;
            }
            if let Err(e) = self.apply(backend.as_ref(), &op).await {
                tracing::warn!(operation = %op, error = %e, "mock backend rejected queued operation");
                self.entry(op.object()).consistent = false;
                first_failure.get_or_insert_with(|| {
                    TaskFailure::new(ErrorKind::RemoteApplyFailed, format!("{op}: {e}"))
                });
            }
        }
        tracing::debug!(operations = total, failed = first_failure.is_some(), "mock flush done");

        match first_failure {
            Some(failure) => {
                self.unreported = Some(failure.clone());
                Err(failure)
            }
            None => Ok(()),
        }
    }

    /// Forget the backend after it went away.
    ///
    /// Later mutations fail with `BackendUnreachable`. An unexpected loss is
    /// reported once by the next registry call.
    pub(crate) fn detach(&mut self, requested: bool) {
        let had_backend = self.backend.take().is_some();
        self.lost = true;
        if had_backend && !requested && self.unreported.is_none() {
            self.unreported = Some(TaskFailure::new(
                ErrorKind::BackendUnreachable,
                "mock backend exited",
            ));
        }
    }

    async fn apply(&mut self, backend: &dyn MockControl, op: &PendingOperation) -> Result<(), BusTestError> {
        let object = op.object();
        self.announce(backend, object).await?;
        match op {
            PendingOperation::AddProperty { name, value, .. } => {
                backend
                    .add_property(&object.path, &object.interface, name, value)
                    .await
            }
            PendingOperation::AddMethod {
                name,
                in_signature,
                out_signature,
                behavior,
                ..
            } => {
                backend
                    .add_method(
                        &object.path,
                        &object.interface,
                        name,
                        in_signature,
                        out_signature,
                        behavior,
                    )
                    .await
            }
            PendingOperation::SetProperty { name, value, .. } => {
                backend
                    .update_property(&object.path, &object.interface, name, value)
                    .await
            }
        }
    }

    async fn announce(&mut self, backend: &dyn MockControl, object: &MockObject) -> Result<(), BusTestError> {
        if self.announced.contains(&object.path) {
            return Ok(());
        }
        backend.add_object(&object.path, &object.interface).await?;
        self.announced.insert(object.path.clone());
        Ok(())
    }

    /// Report a stored failure once, then refuse work if the backend is gone.
    fn check_usable(&mut self) -> Result<(), BusTestError> {
        if let Some(failure) = self.unreported.take() {
            return Err(BusTestError::from_failure(&failure));
        }
        if self.lost {
            return Err(BusTestError::BackendUnreachable(
                "mock backend is no longer running".to_string(),
            ));
        }
        Ok(())
    }

    fn live(&mut self) -> Result<Arc<dyn MockControl>, BusTestError> {
        self.check_usable()?;
        self.backend.clone().ok_or_else(|| {
            BusTestError::BackendUnreachable("mock backend is not running yet".to_string())
        })
    }

    fn entry(&mut self, object: &MockObject) -> &mut ObjectEntry {
        self.objects.entry(object.clone()).or_default()
    }

    fn commit_property(&mut self, object: &MockObject, name: &str, ty: DataType, value: Value) {
        self.entry(object)
            .properties
            .insert(name.to_string(), PropertyEntry { ty, value });
    }

    fn enqueue(&mut self, op: PendingOperation) {
        tracing::debug!(operation = %op, "queued until mock backend is reachable");
        self.pending.push_back(op);
    }
}
