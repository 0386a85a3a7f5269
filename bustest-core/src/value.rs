//! Typed values for mock properties, signal arguments and method call checks.
//!
//! Containers carry their element types so that an empty array or dict still
//! has a well-defined [`DataType`].

use crate::names::{NameError, validate_object_path};
use crate::signature::{DataType, Signature, SignatureError};

/// A value's runtime type disagrees with the type it was checked against.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("expected value of type '{expected}', found '{found}'")]
pub struct TypeMismatch {
    pub expected: String,
    pub found: String,
}

impl TypeMismatch {
    fn new(expected: &DataType, found: &DataType) -> Self {
        Self {
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValueError {
    #[error(transparent)]
    TypeMismatch(#[from] TypeMismatch),

    #[error(transparent)]
    InvalidObjectPath(#[from] NameError),

    #[error("invalid signature value: {0}")]
    InvalidSignature(#[from] SignatureError),

    #[error("dict key type '{0}' is not a basic type")]
    NonBasicKey(String),

    #[error("struct values need at least one field")]
    EmptyStruct,
}

/// An array whose items all share `element` as their type.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayValue {
    element: DataType,
    items: Vec<Value>,
}

impl ArrayValue {
    pub fn element_type(&self) -> &DataType {
        &self.element
    }

    pub fn items(&self) -> &[Value] {
        &self.items
    }
}

/// A dict (`a{kv}`) keeping insertion order of its entries.
#[derive(Debug, Clone, PartialEq)]
pub struct DictValue {
    key: DataType,
    value: DataType,
    entries: Vec<(Value, Value)>,
}

impl DictValue {
    pub fn key_type(&self) -> &DataType {
        &self.key
    }

    pub fn value_type(&self) -> &DataType {
        &self.value
    }

    pub fn entries(&self) -> &[(Value, Value)] {
        &self.entries
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Byte(u8),
    Bool(bool),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    Str(String),
    ObjectPath(String),
    Signature(String),
    Variant(Box<Value>),
    Array(ArrayValue),
    Dict(DictValue),
    Struct(Vec<Value>),
}

impl Value {
    /// Object path value; the path is validated.
    pub fn object_path(path: impl Into<String>) -> Result<Self, ValueError> {
        let path = path.into();
        validate_object_path(&path)?;
        Ok(Self::ObjectPath(path))
    }

    /// Signature value; the signature text is validated.
    pub fn signature(signature: impl Into<String>) -> Result<Self, ValueError> {
        let signature = signature.into();
        Signature::parse(&signature)?;
        Ok(Self::Signature(signature))
    }

    /// Wrap a value in a variant (`v`).
    pub fn variant(inner: Value) -> Self {
        Self::Variant(Box::new(inner))
    }

    /// Struct of the given fields, e.g. `(sssss)`.
    pub fn tuple(fields: impl IntoIterator<Item = Value>) -> Self {
        Self::Struct(fields.into_iter().collect())
    }

    /// Array of `element` typed items. Every item must have that type.
    pub fn array(
        element: DataType,
        items: impl IntoIterator<Item = Value>,
    ) -> Result<Self, TypeMismatch> {
        let items: Vec<Value> = items.into_iter().collect();
        for item in &items {
            item.check(&element)?;
        }
        Ok(Self::Array(ArrayValue { element, items }))
    }

    /// Dict with `key` and `value` typed entries. `key` must be basic.
    pub fn dict(
        key: DataType,
        value: DataType,
        entries: impl IntoIterator<Item = (Value, Value)>,
    ) -> Result<Self, ValueError> {
        if !key.is_basic() {
            return Err(ValueError::NonBasicKey(key.to_string()));
        }
        let entries: Vec<(Value, Value)> = entries.into_iter().collect();
        for (k, v) in &entries {
            k.check(&key)?;
            v.check(&value)?;
        }
        Ok(Self::Dict(DictValue {
            key,
            value,
            entries,
        }))
    }

    /// Runtime type of this value.
    pub fn data_type(&self) -> DataType {
        match self {
            Self::Byte(_) => DataType::Byte,
            Self::Bool(_) => DataType::Boolean,
            Self::Int16(_) => DataType::Int16,
            Self::UInt16(_) => DataType::UInt16,
            Self::Int32(_) => DataType::Int32,
            Self::UInt32(_) => DataType::UInt32,
            Self::Int64(_) => DataType::Int64,
            Self::UInt64(_) => DataType::UInt64,
            Self::Double(_) => DataType::Double,
            Self::Str(_) => DataType::String,
            Self::ObjectPath(_) => DataType::ObjectPath,
            Self::Signature(_) => DataType::Signature,
            Self::Variant(_) => DataType::Variant,
            Self::Array(array) => DataType::Array(Box::new(array.element.clone())),
            Self::Dict(dict) => {
                DataType::Dict(Box::new(dict.key.clone()), Box::new(dict.value.clone()))
            }
            Self::Struct(fields) => DataType::Struct(fields.iter().map(Value::data_type).collect()),
        }
    }

    /// Check this value against a declared type.
    ///
    /// The match is exact: a `u` value does not satisfy an `s` declaration
    /// and a bare value does not satisfy `v` unless wrapped with
    /// [`Value::variant`].
    pub fn check(&self, expected: &DataType) -> Result<(), TypeMismatch> {
        let found = self.data_type();
        if &found == expected {
            Ok(())
        } else {
            Err(TypeMismatch::new(expected, &found))
        }
    }

    /// Check the content of this value and everything nested in it.
    ///
    /// The variants are public, so an object path or signature built without
    /// [`Value::object_path`] or [`Value::signature`] is only caught here.
    pub fn validate(&self) -> Result<(), ValueError> {
        match self {
            Self::ObjectPath(path) => validate_object_path(path)?,
            Self::Signature(signature) => {
                Signature::parse(signature)?;
            }
            Self::Variant(inner) => inner.validate()?,
            Self::Array(array) => {
                for item in &array.items {
                    item.validate()?;
                }
            }
            Self::Dict(dict) => {
                for (key, value) in &dict.entries {
                    key.validate()?;
                    value.validate()?;
                }
            }
            Self::Struct(fields) => {
                if fields.is_empty() {
                    return Err(ValueError::EmptyStruct);
                }
                for field in fields {
                    field.validate()?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Check a list of arguments against a signature, element by element.
    pub fn check_all(values: &[Value], signature: &Signature) -> Result<(), TypeMismatch> {
        let found = Signature::new(values.iter().map(Value::data_type).collect());
        if &found == signature {
            Ok(())
        } else {
            Err(TypeMismatch {
                expected: signature.to_string(),
                found: found.to_string(),
            })
        }
    }
}

macro_rules! impl_from_primitive {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Self::$variant(value)
                }
            }
        )*
    };
}

impl_from_primitive! {
    u8 => Byte,
    bool => Bool,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    i64 => Int64,
    u64 => UInt64,
    f64 => Double,
    String => Str,
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}
