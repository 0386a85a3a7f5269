//! Conversion of [`Value`]s to their bus representation.

use bustest_core::{DataType, Value};
use zbus::zvariant::{self, Array, Dict, ObjectPath, StructureBuilder};

fn signature_of(ty: &DataType) -> zvariant::Result<zvariant::Signature<'static>> {
    zvariant::Signature::try_from(ty.to_string())
}

/// Convert a checked value into a zvariant value.
///
/// Values built through [`Value`]'s constructors are always well-formed, so
/// an error here means the bus library disagrees with local validation.
pub(crate) fn to_zvalue(value: &Value) -> zvariant::Result<zvariant::Value<'static>> {
    let converted = match value {
        Value::Byte(v) => zvariant::Value::from(*v),
        Value::Bool(v) => zvariant::Value::from(*v),
        Value::Int16(v) => zvariant::Value::from(*v),
        Value::UInt16(v) => zvariant::Value::from(*v),
        Value::Int32(v) => zvariant::Value::from(*v),
        Value::UInt32(v) => zvariant::Value::from(*v),
        Value::Int64(v) => zvariant::Value::from(*v),
        Value::UInt64(v) => zvariant::Value::from(*v),
        Value::Double(v) => zvariant::Value::from(*v),
        Value::Str(s) => zvariant::Value::from(s.clone()),
        Value::ObjectPath(p) => zvariant::Value::from(ObjectPath::try_from(p.clone())?),
        Value::Signature(s) => zvariant::Value::from(zvariant::Signature::try_from(s.clone())?),
        Value::Variant(inner) => zvariant::Value::Value(Box::new(to_zvalue(inner)?)),
        Value::Array(array) => {
            let mut out = Array::new(signature_of(array.element_type())?);
            for item in array.items() {
                out.append(to_zvalue(item)?)?;
            }
            zvariant::Value::Array(out)
        }
        Value::Dict(dict) => {
            let mut out = Dict::new(
                signature_of(dict.key_type())?,
                signature_of(dict.value_type())?,
            );
            for (k, v) in dict.entries() {
                out.append(to_zvalue(k)?, to_zvalue(v)?)?;
            }
            zvariant::Value::Dict(out)
        }
        Value::Struct(fields) => {
            let mut builder = StructureBuilder::new();
            for field in fields {
                builder = builder.append_field(to_zvalue(field)?);
            }
            zvariant::Value::Structure(builder.build())
        }
    };
    Ok(converted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signature(value: &Value) -> String {
        to_zvalue(value).unwrap().value_signature().to_string()
    }

    #[test]
    fn test_signatures_agree_with_local_types() {
        let cases = vec![
            Value::from("test"),
            Value::from(5u32),
            Value::variant(Value::from(true)),
            Value::tuple(["a", "b", "c", "d", "e"].map(Value::from)),
            Value::array(DataType::String, Vec::new()).unwrap(),
            Value::dict(
                DataType::String,
                DataType::Variant,
                [(Value::from("k"), Value::variant(Value::from(1i32)))],
            )
            .unwrap(),
            Value::object_path("/org/example").unwrap(),
        ];
        for value in cases {
            assert_eq!(signature(&value), value.data_type().to_string(), "{value:?}");
        }
    }

    #[test]
    fn test_string_content_survives() {
        let converted = to_zvalue(&Value::from("test")).unwrap();
        assert_eq!(converted, zvariant::Value::from("test"));
    }
}
