pub mod schema;
pub mod types;

use crate::catalog::schema::{FieldType, KindSchema, KindSpec};
use crate::error::Error;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Process-wide registry of entity kinds. Built once at startup and shared
/// read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    kinds: BTreeMap<String, Arc<KindSchema>>,
}

impl Catalog {
    pub fn from_specs(specs: impl IntoIterator<Item = KindSpec>) -> Result<Self, Error> {
        let mut kinds = BTreeMap::new();
        for spec in specs {
            let schema = spec.build()?;
            if kinds.contains_key(&schema.name) {
                return Err(Error::InvalidSchema {
                    kind: schema.name.clone(),
                    reason: "kind declared twice".into(),
                });
            }
            kinds.insert(schema.name.clone(), Arc::new(schema));
        }
        let catalog = Self { kinds };
        catalog.validate_links()?;
        Ok(catalog)
    }

    /// Loads a JSON array of [`KindSpec`] declarations.
    pub fn from_json_str(json: &str) -> Result<Self, Error> {
        let specs: Vec<KindSpec> =
            serde_json::from_str(json).map_err(|e| Error::InvalidConfig {
                message: format!("kind declarations: {e}"),
            })?;
        Self::from_specs(specs)
    }

    pub fn kind(&self, name: &str) -> Option<&Arc<KindSchema>> {
        self.kinds.get(name)
    }

    pub fn require(&self, name: &str) -> Result<&Arc<KindSchema>, Error> {
        self.kind(name).ok_or_else(|| Error::UnknownKind {
            kind: name.to_string(),
        })
    }

    pub fn kinds(&self) -> impl Iterator<Item = &Arc<KindSchema>> {
        self.kinds.values()
    }

    fn validate_links(&self) -> Result<(), Error> {
        for schema in self.kinds.values() {
            for field in &schema.fields {
                let invalid = |reason: String| Error::InvalidSchema {
                    kind: schema.name.clone(),
                    reason,
                };
                match &field.field_type {
                    FieldType::Scalar(_) => {}
                    FieldType::Reference { kind } => {
                        if !self.kinds.contains_key(kind) {
                            return Err(invalid(format!(
                                "field '{}' references unknown kind '{kind}'",
                                field.name
                            )));
                        }
                    }
                    FieldType::BackReference { kind, field: fk } => {
                        let target = self.kinds.get(kind).ok_or_else(|| {
                            invalid(format!(
                                "edge '{}' targets unknown kind '{kind}'",
                                field.name
                            ))
                        })?;
                        let points_back = target.stored_field(fk).is_some_and(|f| {
                            matches!(&f.field_type, FieldType::Reference { kind } if *kind == schema.name)
                        });
                        if !points_back {
                            return Err(invalid(format!(
                                "edge '{}' needs '{kind}.{fk}' to reference '{}'",
                                field.name, schema.name
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
