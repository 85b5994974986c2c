//! Named document filters a subscription can apply to candidates.

use crate::types::Document;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// What a filter decided for one document.
#[derive(Clone, Debug, PartialEq)]
pub enum FilterOutcome {
    Rejected,
    /// Send the document, optionally with a projected body.
    Accepted(Option<Value>),
}

/// Failure raised while running a filter; delivered to the client as a per-document error.
#[derive(Clone, Debug, PartialEq)]
pub struct ScriptError(pub String);

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub trait DocumentFilter: Send + Sync {
    fn apply(&self, document: &Document) -> Result<FilterOutcome, ScriptError>;
}

impl<F> DocumentFilter for F
where
    F: Fn(&Document) -> Result<FilterOutcome, ScriptError> + Send + Sync,
{
    fn apply(&self, document: &Document) -> Result<FilterOutcome, ScriptError> {
        self(document)
    }
}

/// Filters registered on a database, by case-insensitive name.
#[derive(Default)]
pub struct FilterRegistry {
    filters: RwLock<HashMap<String, Arc<dyn DocumentFilter>>>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, filter: Arc<dyn DocumentFilter>) {
        self.filters.write().insert(name.to_lowercase(), filter);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DocumentFilter>> {
        self.filters.read().get(&name.to_lowercase()).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Bucket, DocumentId, Etag, Timestamp};
    use serde_json::json;

    fn document(age: i64) -> Document {
        Document {
            id: DocumentId::new("users/1"),
            collection: "Users".into(),
            data: Some(json!({ "age": age })),
            change_vector: Default::default(),
            etag: Etag(1),
            bucket: Bucket(0),
            last_modified: Timestamp::now(),
        }
    }

    #[test]
    fn test_closure_filters() {
        let registry = FilterRegistry::new();
        registry.register(
            "Adults",
            Arc::new(|doc: &Document| -> Result<FilterOutcome, ScriptError> {
                let age = doc
                    .data
                    .as_ref()
                    .and_then(|data| data["age"].as_i64())
                    .ok_or_else(|| ScriptError("age missing".into()))?;
                Ok(if age >= 18 {
                    FilterOutcome::Accepted(None)
                } else {
                    FilterOutcome::Rejected
                })
            }),
        );

        let filter = registry.get("adults").unwrap();
        assert_eq!(filter.apply(&document(30)).unwrap(), FilterOutcome::Accepted(None));
        assert_eq!(filter.apply(&document(3)).unwrap(), FilterOutcome::Rejected);
        assert!(registry.get("minors").is_none());
    }
}
