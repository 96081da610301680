//! Transformer selection by name: a registry keyed by identifier mapping to
//! a pure function plus an optional inverse, registered at admission time
//! rather than looked up from module paths at runtime (§9 "Factories /
//! plugin lookup").

use std::collections::HashMap;
use std::sync::Arc;
use store_driver::Record;

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("no transformer is registered for {0:?}")]
    NotFound(String),
    #[error("transformer {name:?} rejected record {record_id:?}: {reason}")]
    Rejected {
        name: String,
        record_id: String,
        reason: String,
    },
}

/// A pure function over one record: `Some` to keep (possibly modified),
/// `None` to drop it from the batch.
pub type TransformFn = Arc<dyn Fn(&Record) -> Result<Option<Record>, String> + Send + Sync>;

#[derive(Clone)]
pub struct Transformer {
    pub forward: TransformFn,
    pub inverse: Option<TransformFn>,
}

/// Registry maps a request step's `payload_ref` to a registered
/// `Transformer`. Populated once at process start (or admission time for
/// dynamically-loaded sets); never consulted as a module-path lookup.
#[derive(Clone, Default)]
pub struct Registry {
    entries: HashMap<String, Transformer>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        forward: impl Fn(&Record) -> Result<Option<Record>, String> + Send + Sync + 'static,
        inverse: Option<Arc<dyn Fn(&Record) -> Result<Option<Record>, String> + Send + Sync>>,
    ) -> &mut Self {
        self.entries.insert(
            name.into(),
            Transformer {
                forward: Arc::new(forward),
                inverse,
            },
        );
        self
    }

    pub fn has_inverse(&self, name: &str) -> bool {
        self.entries
            .get(name)
            .is_some_and(|t| t.inverse.is_some())
    }

    /// Applies the named transformer to `record`, mapping a rejection into
    /// `TransformError::Rejected` -- a logical error, never retried (§7).
    pub fn apply(&self, name: &str, record: &Record) -> Result<Option<Record>, TransformError> {
        let transformer = self
            .entries
            .get(name)
            .ok_or_else(|| TransformError::NotFound(name.to_string()))?;

        (transformer.forward)(record).map_err(|reason| TransformError::Rejected {
            name: name.to_string(),
            record_id: record.id.clone(),
            reason,
        })
    }

    /// Applies the registered inverse, if any. Used both for rollback
    /// compensation (§4.6) and the round-trip law in §8.
    pub fn apply_inverse(
        &self,
        name: &str,
        record: &Record,
    ) -> Result<Option<Record>, TransformError> {
        let transformer = self
            .entries
            .get(name)
            .ok_or_else(|| TransformError::NotFound(name.to_string()))?;

        let Some(inverse) = &transformer.inverse else {
            return Err(TransformError::Rejected {
                name: name.to_string(),
                record_id: record.id.clone(),
                reason: "no inverse is registered".to_string(),
            });
        };

        inverse(record).map_err(|reason| TransformError::Rejected {
            name: name.to_string(),
            record_id: record.id.clone(),
            reason,
        })
    }
}

/// Registers a small set of field-level transformers useful for the
/// scenarios in §8: setting a literal field, and its inverse, removing it.
pub fn set_field(registry: &mut Registry, name: &str, field: &'static str, value: serde_json::Value) {
    let inverse_field = field;
    registry.register(
        name,
        move |record| {
            let mut fields = record.fields.clone();
            if let serde_json::Value::Object(map) = &mut fields {
                map.insert(field.to_string(), value.clone());
            }
            Ok(Some(Record {
                id: record.id.clone(),
                fields,
            }))
        },
        Some(Arc::new(move |record: &Record| {
            let mut fields = record.fields.clone();
            if let serde_json::Value::Object(map) = &mut fields {
                map.remove(inverse_field);
            }
            Ok(Some(Record {
                id: record.id.clone(),
                fields,
            }))
        })),
    );
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn inverse_undoes_forward_on_the_fields_in_scope() {
        let mut registry = Registry::new();
        set_field(&mut registry, "set_version", "version", serde_json::json!(2));

        let original = Record {
            id: "r1".into(),
            fields: serde_json::json!({"name": "a"}),
        };

        let forward = registry.apply("set_version", &original).unwrap().unwrap();
        assert_eq!(forward.fields["version"], 2);

        let back = registry.apply_inverse("set_version", &forward).unwrap().unwrap();
        assert_eq!(back.fields, original.fields);
    }

    #[test]
    fn unknown_transformer_is_not_found() {
        let registry = Registry::new();
        let record = Record {
            id: "r1".into(),
            fields: serde_json::json!({}),
        };
        assert!(matches!(
            registry.apply("missing", &record),
            Err(TransformError::NotFound(_))
        ));
    }

    #[test]
    fn rejection_surfaces_as_a_typed_error() {
        let mut registry = Registry::new();
        registry.register(
            "always_reject",
            |_record| Err("poison record".to_string()),
            None,
        );
        let record = Record {
            id: "r1".into(),
            fields: serde_json::json!({}),
        };
        let err = registry.apply("always_reject", &record).unwrap_err();
        assert!(matches!(err, TransformError::Rejected { .. }));
    }
}
