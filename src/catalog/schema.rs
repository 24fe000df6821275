use crate::catalog::types::ScalarType;
use crate::error::Error;
use crate::permission::Mask;
use crate::query::filter::RESERVED_WORDS;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum FieldType {
    Scalar(ScalarType),
    /// Foreign key holding the primary key of a record of `kind`.
    Reference { kind: String },
    /// Virtual edge: records of `kind` whose `field` references this record.
    BackReference { kind: String, field: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub mask: Option<Mask>,
}

impl FieldDescriptor {
    /// Back-references are not stored on the record, so they cannot be
    /// filtered, sorted, projected or written.
    pub fn is_stored(&self) -> bool {
        !matches!(self.field_type, FieldType::BackReference { .. })
    }
}

/// Validated, immutable description of one entity kind.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct KindSchema {
    pub name: String,
    pub fields: Vec<FieldDescriptor>,
    pub primary_key: String,
    pub mask: Mask,
    pub owner_field: Option<String>,
    pub group_field: Option<String>,
}

impl KindSchema {
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn stored_field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.field(name).filter(|f| f.is_stored())
    }

    pub fn stored_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(|f| f.is_stored())
    }

    pub fn edge(&self, name: &str) -> Option<(&str, &str)> {
        match &self.field(name)?.field_type {
            FieldType::BackReference { kind, field } => Some((kind.as_str(), field.as_str())),
            _ => None,
        }
    }
}

/// Builder for [`KindSchema`]. Every declaration is checked in [`KindSpec::build`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KindSpec {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FieldDescriptor>,
    #[serde(default)]
    pub primary_key: Option<String>,
    #[serde(default)]
    pub mask: Option<Mask>,
    #[serde(default)]
    pub owner_field: Option<String>,
    #[serde(default)]
    pub group_field: Option<String>,
}

impl KindSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn field(mut self, name: impl Into<String>, scalar: ScalarType) -> Self {
        self.fields.push(FieldDescriptor {
            name: name.into(),
            field_type: FieldType::Scalar(scalar),
            mask: None,
        });
        self
    }

    pub fn field_masked(mut self, name: impl Into<String>, scalar: ScalarType, mask: Mask) -> Self {
        self.fields.push(FieldDescriptor {
            name: name.into(),
            field_type: FieldType::Scalar(scalar),
            mask: Some(mask),
        });
        self
    }

    pub fn reference(mut self, name: impl Into<String>, kind: impl Into<String>) -> Self {
        self.fields.push(FieldDescriptor {
            name: name.into(),
            field_type: FieldType::Reference { kind: kind.into() },
            mask: None,
        });
        self
    }

    pub fn back_reference(
        mut self,
        name: impl Into<String>,
        kind: impl Into<String>,
        field: impl Into<String>,
    ) -> Self {
        self.fields.push(FieldDescriptor {
            name: name.into(),
            field_type: FieldType::BackReference {
                kind: kind.into(),
                field: field.into(),
            },
            mask: None,
        });
        self
    }

    pub fn primary_key(mut self, field: impl Into<String>) -> Self {
        self.primary_key = Some(field.into());
        self
    }

    pub fn mask(mut self, mask: Mask) -> Self {
        self.mask = Some(mask);
        self
    }

    pub fn owner_field(mut self, field: impl Into<String>) -> Self {
        self.owner_field = Some(field.into());
        self
    }

    pub fn group_field(mut self, field: impl Into<String>) -> Self {
        self.group_field = Some(field.into());
        self
    }

    pub fn build(self) -> Result<KindSchema, Error> {
        let invalid = |reason: String| Error::InvalidSchema {
            kind: self.name.clone(),
            reason,
        };
        if !is_identifier(&self.name) {
            return Err(invalid(
                "kind name must be a non-empty identifier of [A-Za-z0-9_]".into(),
            ));
        }
        let mask = self
            .mask
            .ok_or_else(|| invalid("model permission mask must be declared".into()))?;

        let mut seen = BTreeSet::new();
        for field in &self.fields {
            if !is_identifier(&field.name) || field.name.starts_with(|c: char| c.is_ascii_digit()) {
                return Err(invalid(format!("field name '{}' is not an identifier", field.name)));
            }
            if RESERVED_WORDS.iter().any(|w| field.name.eq_ignore_ascii_case(w)) {
                return Err(invalid(format!("field name '{}' is a reserved word", field.name)));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(invalid(format!("duplicate field '{}'", field.name)));
            }
            if let FieldType::BackReference { kind, field: fk } = &field.field_type {
                if kind.is_empty() || fk.is_empty() {
                    return Err(invalid(format!(
                        "back-reference '{}' must name a kind and a field",
                        field.name
                    )));
                }
            }
        }

        let stored = |name: &str| {
            self.fields
                .iter()
                .any(|f| f.name == name && f.is_stored())
        };
        let primary_key = self
            .primary_key
            .clone()
            .ok_or_else(|| invalid("primary key must be declared".into()))?;
        if !stored(&primary_key) {
            return Err(invalid(format!(
                "primary key '{primary_key}' is not a stored field"
            )));
        }
        for (role, field) in [("owner", &self.owner_field), ("group", &self.group_field)] {
            if let Some(name) = field {
                if !stored(name) {
                    return Err(invalid(format!(
                        "{role} field '{name}' is not a stored field"
                    )));
                }
            }
        }

        Ok(KindSchema {
            name: self.name,
            fields: self.fields,
            primary_key,
            mask,
            owner_field: self.owner_field,
            group_field: self.group_field,
        })
    }
}

/// Names appear in filter text and cache keys, so they are restricted to
/// word characters.
fn is_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
