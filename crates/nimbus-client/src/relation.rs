//! Many-to-many relations stored on a parent record.

use serde_json::{Value, json};

use crate::Query;
use crate::types::Pointer;

/// The members of one relation field of a saved record.
///
/// Membership changes are queued on the parent with
/// [`crate::Record::add_relation`] and [`crate::Record::remove_relation`];
/// this type only reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    parent: Pointer,
    key: String,
    target_class: Option<String>,
}

impl Relation {
    pub fn new(parent: Pointer, key: impl Into<String>, target_class: Option<String>) -> Self {
        Self {
            parent,
            key: key.into(),
            target_class,
        }
    }

    pub fn parent(&self) -> &Pointer {
        &self.parent
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn target_class(&self) -> Option<&str> {
        self.target_class.as_deref()
    }

    /// A query limited to the records in this relation.
    ///
    /// When the target class is unknown locally, the server is asked to
    /// resolve it from the parent's schema.
    pub fn query(&self) -> Query {
        let mut query = match &self.target_class {
            Some(class_name) => Query::new(class_name.as_str()),
            None => {
                let mut query = Query::new(self.parent.class_name.as_str());
                query.redirect_class_name_for_key(&self.key);
                query
            }
        };
        query.related_to(self.parent.clone(), &self.key);
        query
    }

    /// The `{"__type": "Relation"}` value describing this field.
    pub fn to_json(&self) -> Value {
        json!({
            "__type": "Relation",
            "className": self.target_class,
        })
    }
}
