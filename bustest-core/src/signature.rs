//! D-Bus type signatures.
//!
//! A [`DataType`] is one complete type (`s`, `a{sv}`, `(sssss)`, ...). A
//! [`Signature`] is a sequence of zero or more complete types, which is what
//! method argument lists use. Property declarations require exactly one
//! complete type.

use std::fmt;
use std::str::FromStr;

const MAX_SIGNATURE_LEN: usize = 255;
const MAX_ARRAY_DEPTH: usize = 32;
const MAX_STRUCT_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("signature is longer than 255 bytes")]
    TooLong,

    #[error("expected exactly one complete type, found {0}")]
    NotSingleType(usize),

    #[error("unexpected end of signature")]
    UnexpectedEnd,

    #[error("unknown type code '{code}' at offset {offset}")]
    UnknownTypeCode { code: char, offset: usize },

    #[error("unsupported type code '{code}' at offset {offset}")]
    Unsupported { code: char, offset: usize },

    #[error("unexpected '{code}' at offset {offset}")]
    Unexpected { code: char, offset: usize },

    #[error("dict entry outside of an array at offset {0}")]
    DictEntryOutsideArray(usize),

    #[error("dict key must be a basic type, found '{0}'")]
    DictKeyNotBasic(String),

    #[error("empty struct at offset {0}")]
    EmptyStruct(usize),

    #[error("containers nested too deeply")]
    TooDeep,
}

/// One complete D-Bus type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DataType {
    Byte,
    Boolean,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Double,
    String,
    ObjectPath,
    Signature,
    Variant,
    Array(Box<DataType>),
    Dict(Box<DataType>, Box<DataType>),
    Struct(Vec<DataType>),
}

impl DataType {
    /// Basic types are the ones allowed as dict keys.
    pub fn is_basic(&self) -> bool {
        !matches!(
            self,
            Self::Variant | Self::Array(_) | Self::Dict(_, _) | Self::Struct(_)
        )
    }

    fn basic_from_code(code: u8) -> Option<Self> {
        Some(match code {
            b'y' => Self::Byte,
            b'b' => Self::Boolean,
            b'n' => Self::Int16,
            b'q' => Self::UInt16,
            b'i' => Self::Int32,
            b'u' => Self::UInt32,
            b'x' => Self::Int64,
            b't' => Self::UInt64,
            b'd' => Self::Double,
            b's' => Self::String,
            b'o' => Self::ObjectPath,
            b'g' => Self::Signature,
            b'v' => Self::Variant,
            _ => return None,
        })
    }

    fn write_to(&self, out: &mut String) {
        match self {
            Self::Byte => out.push('y'),
            Self::Boolean => out.push('b'),
            Self::Int16 => out.push('n'),
            Self::UInt16 => out.push('q'),
            Self::Int32 => out.push('i'),
            Self::UInt32 => out.push('u'),
            Self::Int64 => out.push('x'),
            Self::UInt64 => out.push('t'),
            Self::Double => out.push('d'),
            Self::String => out.push('s'),
            Self::ObjectPath => out.push('o'),
            Self::Signature => out.push('g'),
            Self::Variant => out.push('v'),
            Self::Array(element) => {
                out.push('a');
                element.write_to(out);
            }
            Self::Dict(key, value) => {
                out.push_str("a{");
                key.write_to(out);
                value.write_to(out);
                out.push('}');
            }
            Self::Struct(fields) => {
                out.push('(');
                for field in fields {
                    field.write_to(out);
                }
                out.push(')');
            }
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        self.write_to(&mut out);
        f.write_str(&out)
    }
}

impl FromStr for DataType {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut types = Signature::from_str(s)?.types;
        if types.len() != 1 {
            return Err(SignatureError::NotSingleType(types.len()));
        }
        Ok(types.remove(0))
    }
}

/// A sequence of complete types, possibly empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Signature {
    types: Vec<DataType>,
}

impl Signature {
    pub fn new(types: Vec<DataType>) -> Self {
        Self { types }
    }

    pub fn parse(s: &str) -> Result<Self, SignatureError> {
        s.parse()
    }

    pub fn types(&self) -> &[DataType] {
        &self.types
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// The only type, if the signature holds exactly one.
    pub fn single(&self) -> Option<&DataType> {
        match self.types.as_slice() {
            [only] => Some(only),
            _ => None,
        }
    }
}

impl From<DataType> for Signature {
    fn from(ty: DataType) -> Self {
        Self { types: vec![ty] }
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        for ty in &self.types {
            ty.write_to(&mut out);
        }
        f.write_str(&out)
    }
}

impl FromStr for Signature {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() > MAX_SIGNATURE_LEN {
            return Err(SignatureError::TooLong);
        }
        let mut parser = Parser {
            bytes: s.as_bytes(),
            pos: 0,
        };
        let mut types = Vec::new();
        while !parser.at_end() {
            types.push(parser.complete_type(0, 0)?);
        }
        Ok(Self { types })
    }
}

impl TryFrom<&str> for Signature {
    type Error = SignatureError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl TryFrom<&str> for DataType {
    type Error = SignatureError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.parse()
    }
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Result<u8, SignatureError> {
        let code = self.peek().ok_or(SignatureError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(code)
    }

    fn complete_type(
        &mut self,
        array_depth: usize,
        struct_depth: usize,
    ) -> Result<DataType, SignatureError> {
        let offset = self.pos;
        let code = self.bump()?;
        if let Some(basic) = DataType::basic_from_code(code) {
            return Ok(basic);
        }
        match code {
            b'a' => {
                if array_depth >= MAX_ARRAY_DEPTH {
                    return Err(SignatureError::TooDeep);
                }
                if self.peek() == Some(b'{') {
                    self.pos += 1;
                    self.dict_entry(array_depth + 1, struct_depth)
                } else {
                    let element = self.complete_type(array_depth + 1, struct_depth)?;
                    Ok(DataType::Array(Box::new(element)))
                }
            }
            b'(' => {
                if struct_depth >= MAX_STRUCT_DEPTH {
                    return Err(SignatureError::TooDeep);
                }
                let mut fields = Vec::new();
                loop {
                    match self.peek() {
                        None => return Err(SignatureError::UnexpectedEnd),
                        Some(b')') => {
                            self.pos += 1;
                            break;
                        }
                        Some(_) => fields.push(self.complete_type(array_depth, struct_depth + 1)?),
                    }
                }
                if fields.is_empty() {
                    return Err(SignatureError::EmptyStruct(offset));
                }
                Ok(DataType::Struct(fields))
            }
            b'{' => Err(SignatureError::DictEntryOutsideArray(offset)),
            b'h' => Err(SignatureError::Unsupported {
                code: 'h',
                offset,
            }),
            b')' | b'}' => Err(SignatureError::Unexpected {
                code: char::from(code),
                offset,
            }),
            other => Err(SignatureError::UnknownTypeCode {
                code: char::from(other),
                offset,
            }),
        }
    }

    fn dict_entry(
        &mut self,
        array_depth: usize,
        struct_depth: usize,
    ) -> Result<DataType, SignatureError> {
        let key = self.complete_type(array_depth, struct_depth + 1)?;
        if !key.is_basic() {
            return Err(SignatureError::DictKeyNotBasic(key.to_string()));
        }
        let value = self.complete_type(array_depth, struct_depth + 1)?;
        let offset = self.pos;
        match self.bump()? {
            b'}' => Ok(DataType::Dict(Box::new(key), Box::new(value))),
            other => Err(SignatureError::Unexpected {
                code: char::from(other),
                offset,
            }),
        }
    }
}
