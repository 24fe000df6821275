use crate::catalog::schema::KindSchema;
use crate::catalog::types::{Record, ScalarType, Value};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

/// Unix-style permission bits for one kind or field.
///
/// Layout: bits `[8:6]` owner, `[5:3]` group, `[2:0]` other, each `r w x`.
/// Only read and write are meaningful; the execute bit is kept but ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Mask(u16);

const READ: u16 = 0o4;
const WRITE: u16 = 0o2;

impl Mask {
    pub const ALL: Mask = Mask(0o777);
    pub const NONE: Mask = Mask(0);

    pub fn new(bits: u16) -> Option<Mask> {
        (bits <= 0o777).then_some(Mask(bits))
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn intersect(self, other: Mask) -> Mask {
        Mask(self.0 & other.0)
    }

    fn triad(self, rel: Relationship) -> u16 {
        (self.0 >> rel.shift()) & 0o7
    }

    pub fn allows(self, rel: Relationship, access: Access) -> bool {
        let bit = match access {
            Access::Read => READ,
            Access::Write => WRITE,
        };
        self.triad(rel) & bit != 0
    }

    /// True when every read/write grant in `self` is also present in `other`.
    pub fn is_within(self, other: Mask) -> bool {
        self.0 & !other.0 & 0o666 == 0
    }
}

impl fmt::Display for Mask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0o{:03o}", self.0)
    }
}

impl Serialize for Mask {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(self.0)
    }
}

impl<'de> Deserialize<'de> for Mask {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum MaskRepr {
            Bits(u16),
            Octal(String),
        }
        let bits = match MaskRepr::deserialize(deserializer)? {
            MaskRepr::Bits(bits) => bits,
            MaskRepr::Octal(text) => {
                let digits = text.strip_prefix("0o").unwrap_or(&text);
                u16::from_str_radix(digits, 8)
                    .map_err(|_| de::Error::custom(format!("invalid octal mask '{text}'")))?
            }
        };
        Mask::new(bits).ok_or_else(|| de::Error::custom(format!("mask {bits:#o} exceeds 0o777")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Relationship {
    Owner,
    Group,
    Other,
}

impl Relationship {
    fn shift(self) -> u16 {
        match self {
            Relationship::Owner => 6,
            Relationship::Group => 3,
            Relationship::Other => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Relationship::Owner => "owner",
            Relationship::Group => "group",
            Relationship::Other => "other",
        }
    }

    /// The more privileged of two relationships.
    pub fn closest(self, other: Relationship) -> Relationship {
        self.min(other)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// Identity of the caller as resolved by the authentication layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequesterContext {
    pub caller_id: Option<Value>,
    #[serde(default)]
    pub groups: Vec<Value>,
    /// Relationship asserted by the caller's identity provider for requests
    /// that are not tied to one record.
    #[serde(default)]
    pub relationship_hint: Option<Relationship>,
}

impl RequesterContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn caller(caller_id: impl Into<Value>) -> Self {
        Self {
            caller_id: Some(caller_id.into()),
            ..Self::default()
        }
    }

    pub fn with_group(mut self, group: impl Into<Value>) -> Self {
        self.groups.push(group.into());
        self
    }

    pub fn with_hint(mut self, relationship: Relationship) -> Self {
        self.relationship_hint = Some(relationship);
        self
    }

    /// Relationship used for checks that do not depend on a specific row.
    pub fn static_relationship(&self) -> Relationship {
        self.relationship_hint.unwrap_or(Relationship::Other)
    }
}

/// Classifies a requester relative to one record.
pub trait RelationshipResolver: Send + Sync {
    fn relationship(
        &self,
        schema: &KindSchema,
        requester: &RequesterContext,
        record: &Record,
    ) -> Relationship;
}

/// Default resolver: ownership and group membership come from the record's
/// declared owner and group fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldOwnershipResolver;

impl RelationshipResolver for FieldOwnershipResolver {
    fn relationship(
        &self,
        schema: &KindSchema,
        requester: &RequesterContext,
        record: &Record,
    ) -> Relationship {
        let field_value = |field: &Option<String>| {
            field
                .as_deref()
                .and_then(|name| record.get(name))
                .filter(|v| !v.is_null())
        };
        let is_owner = field_value(&schema.owner_field)
            .zip(requester.caller_id.as_ref())
            .is_some_and(|(owner, caller)| owner == caller);
        let in_group = field_value(&schema.group_field)
            .is_some_and(|group| requester.groups.contains(group));
        let from_record = if is_owner {
            Relationship::Owner
        } else if in_group {
            Relationship::Group
        } else {
            Relationship::Other
        };
        from_record.closest(requester.static_relationship())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PermissionError {
    #[error("kind '{kind}' is not writable for {relationship:?}")]
    ModelNotWritable {
        kind: String,
        relationship: Relationship,
    },
    #[error("field '{field}' of kind '{kind}' is not writable for {relationship:?}")]
    FieldNotWritable {
        kind: String,
        field: String,
        relationship: Relationship,
    },
    #[error("field '{field}' does not exist on kind '{kind}'")]
    UnknownField { kind: String, field: String },
    #[error("field '{field}' of kind '{kind}' is the primary key and cannot be changed")]
    ImmutableField { kind: String, field: String },
    #[error("field '{field}' of kind '{kind}' expects a {expected:?} value")]
    TypeMismatch {
        kind: String,
        field: String,
        expected: ScalarType,
    },
}

pub fn model_mask(schema: &KindSchema) -> Mask {
    schema.mask
}

/// Declared field mask; undeclared fields inherit the model mask unchanged.
pub fn field_mask(schema: &KindSchema, field: &str) -> Mask {
    schema
        .field(field)
        .and_then(|f| f.mask)
        .unwrap_or(Mask::ALL)
}

pub fn effective_field_mask(schema: &KindSchema, field: &str) -> Mask {
    model_mask(schema).intersect(field_mask(schema, field))
}

pub fn can_read(schema: &KindSchema, field: &str, rel: Relationship) -> bool {
    schema.stored_field(field).is_some()
        && effective_field_mask(schema, field).allows(rel, Access::Read)
}

pub fn can_write(schema: &KindSchema, field: &str, rel: Relationship) -> bool {
    schema.stored_field(field).is_some()
        && effective_field_mask(schema, field).allows(rel, Access::Write)
}

pub fn model_readable(schema: &KindSchema, rel: Relationship) -> bool {
    model_mask(schema).allows(rel, Access::Read)
}

pub fn model_writable(schema: &KindSchema, rel: Relationship) -> bool {
    model_mask(schema).allows(rel, Access::Write)
}

pub fn readable_fields(schema: &KindSchema, rel: Relationship) -> Vec<&str> {
    schema
        .stored_fields()
        .filter(|f| can_read(schema, &f.name, rel))
        .map(|f| f.name.as_str())
        .collect()
}

pub fn writable_fields(schema: &KindSchema, rel: Relationship) -> Vec<&str> {
    schema
        .stored_fields()
        .filter(|f| can_write(schema, &f.name, rel))
        .map(|f| f.name.as_str())
        .collect()
}
