//! Validation of object paths, interface names, member names and bus names.
//!
//! Rules follow the D-Bus specification. Validation happens locally so that
//! malformed declarations are rejected before anything reaches the bus.

const MAX_NAME_LEN: usize = 255;

/// Which kind of name failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameKind {
    ObjectPath,
    Interface,
    Member,
    BusName,
}

impl NameKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ObjectPath => "object path",
            Self::Interface => "interface name",
            Self::Member => "member name",
            Self::BusName => "bus name",
        }
    }
}

impl std::fmt::Display for NameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind} '{name}': {reason}")]
pub struct NameError {
    pub kind: NameKind,
    pub name: String,
    pub reason: &'static str,
}

impl NameError {
    fn new(kind: NameKind, name: &str, reason: &'static str) -> Self {
        Self {
            kind,
            name: name.to_string(),
            reason,
        }
    }
}

fn is_element_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// `/` or `/a/b_c/d1`; no empty elements, no trailing slash.
pub fn validate_object_path(path: &str) -> Result<(), NameError> {
    let err = |reason| NameError::new(NameKind::ObjectPath, path, reason);
    let Some(rest) = path.strip_prefix('/') else {
        return Err(err("must start with '/'"));
    };
    if rest.is_empty() {
        return Ok(());
    }
    for element in rest.split('/') {
        if element.is_empty() {
            return Err(err("empty path element"));
        }
        if !element.chars().all(is_element_char) {
            return Err(err("elements may only contain [A-Za-z0-9_]"));
        }
    }
    Ok(())
}

fn validate_dotted(
    kind: NameKind,
    name: &str,
    allow_hyphen: bool,
    allow_leading_digit: bool,
) -> Result<(), NameError> {
    let err = |reason| NameError::new(kind, name, reason);
    if name.is_empty() {
        return Err(err("cannot be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(err("longer than 255 bytes"));
    }
    let mut elements = 0usize;
    for element in name.split('.') {
        elements += 1;
        let mut chars = element.chars();
        let Some(first) = chars.next() else {
            return Err(err("empty element"));
        };
        if first.is_ascii_digit() && !allow_leading_digit {
            return Err(err("element starts with a digit"));
        }
        let valid = |c: char| is_element_char(c) || (allow_hyphen && c == '-');
        if !valid(first) || !chars.all(valid) {
            return Err(err("contains invalid characters"));
        }
    }
    if elements < 2 {
        return Err(err("needs at least two dot-separated elements"));
    }
    Ok(())
}

/// `org.example.Interface`.
pub fn validate_interface_name(name: &str) -> Result<(), NameError> {
    validate_dotted(NameKind::Interface, name, false, false)
}

/// Well-known bus name such as `org.example.Service`. Unique names (`:1.42`)
/// are owned by the bus, never requested by tasks, so they are rejected.
pub fn validate_bus_name(name: &str) -> Result<(), NameError> {
    if name.starts_with(':') {
        return Err(NameError::new(
            NameKind::BusName,
            name,
            "unique names cannot be requested",
        ));
    }
    validate_dotted(NameKind::BusName, name, true, false)
}

/// Method, property or signal name.
pub fn validate_member_name(name: &str) -> Result<(), NameError> {
    let err = |reason| NameError::new(NameKind::Member, name, reason);
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return Err(err("cannot be empty"));
    };
    if name.len() > MAX_NAME_LEN {
        return Err(err("longer than 255 bytes"));
    }
    if first.is_ascii_digit() {
        return Err(err("starts with a digit"));
    }
    if !is_element_char(first) || !chars.all(is_element_char) {
        return Err(err("may only contain [A-Za-z0-9_]"));
    }
    Ok(())
}
