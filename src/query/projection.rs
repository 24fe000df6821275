//! Redaction of records on the way out and payload checks on the way in.

use crate::catalog::schema::{FieldType, KindSchema};
use crate::catalog::types::Record;
use crate::permission::{
    PermissionError, Relationship, RelationshipResolver, RequesterContext, can_read, can_write,
    model_writable,
};

/// Copies the fields of `record` that were requested (all when `fields` is
/// empty) and that `rel` may read. Hidden fields are absent, not null.
pub fn project_read(schema: &KindSchema, record: &Record, fields: &[String], rel: Relationship) -> Record {
    record
        .fields
        .iter()
        .filter(|(name, _)| fields.is_empty() || fields.iter().any(|f| f == *name))
        .filter(|(name, _)| can_read(schema, name, rel))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Accepts `payload` only if every field in it is writable for `rel` and
/// holds a value of the field's type. The primary key never changes.
/// Nothing is mutated here; callers write only after this returns `Ok`.
pub fn check_write(schema: &KindSchema, payload: &Record, rel: Relationship) -> Result<(), PermissionError> {
    if !model_writable(schema, rel) {
        return Err(PermissionError::ModelNotWritable {
            kind: schema.name.clone(),
            relationship: rel,
        });
    }
    for name in payload.names() {
        let Some(field) = schema.field(name) else {
            return Err(PermissionError::UnknownField {
                kind: schema.name.clone(),
                field: name.to_string(),
            });
        };
        if !field.is_stored() || !can_write(schema, name, rel) {
            return Err(PermissionError::FieldNotWritable {
                kind: schema.name.clone(),
                field: name.to_string(),
                relationship: rel,
            });
        }
        if name == schema.primary_key {
            return Err(PermissionError::ImmutableField {
                kind: schema.name.clone(),
                field: name.to_string(),
            });
        }
        if let (FieldType::Scalar(expected), Some(value)) = (&field.field_type, payload.get(name)) {
            if !value.fits(*expected) {
                return Err(PermissionError::TypeMismatch {
                    kind: schema.name.clone(),
                    field: name.to_string(),
                    expected: *expected,
                });
            }
        }
    }
    Ok(())
}

/// Redacts each row with the requester's relationship to that row.
pub fn project_rows(
    schema: &KindSchema,
    rows: &[Record],
    fields: &[String],
    resolver: &dyn RelationshipResolver,
    requester: &RequesterContext,
) -> Vec<Record> {
    rows.iter()
        .map(|row| {
            let rel = resolver.relationship(schema, requester, row);
            project_read(schema, row, fields, rel)
        })
        .collect()
}
