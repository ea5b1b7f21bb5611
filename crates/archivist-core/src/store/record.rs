//! Record trait, natural keys and the deep-merge used by upserts.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

/// Unknown fields of a record, preserved verbatim across read/write cycles.
pub type Extra = Map<String, Value>;

/// A record type persisted in its own collection.
///
/// Implementors declare the collection file they live in and the field(s)
/// forming their natural key. Unknown fields must be captured with
/// `#[serde(flatten)] extra: Extra` so they survive a round trip.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Collection name; also the file stem and lock name.
    const COLLECTION: &'static str;

    /// Fields forming the natural key, in key order.
    const KEY_FIELDS: &'static [&'static str];

    /// The natural key of this record.
    fn key(&self) -> RecordKey;
}

/// Ordered natural-key values of a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey(Vec<String>);

impl RecordKey {
    /// Key of a single-field record.
    #[must_use]
    pub fn single(value: impl Into<String>) -> Self {
        Self(vec![value.into()])
    }

    /// Key of a composite-key record, in the record type's key-field order.
    #[must_use]
    pub fn composite<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    #[must_use]
    pub fn parts(&self) -> &[String] {
        &self.0
    }

    /// JSON object holding just the key fields, used to seed a new record.
    pub(crate) fn seed_object(&self, fields: &[&str]) -> Map<String, Value> {
        fields
            .iter()
            .zip(&self.0)
            .map(|(field, value)| ((*field).to_string(), Value::String(value.clone())))
            .collect()
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

/// Recursively merge `patch` into `target`: objects present on both sides
/// merge key by key, anything else in `patch` replaces the target value.
pub fn deep_merge(target: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, incoming) in patch {
        match (target.get_mut(key), incoming) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge(existing, incoming);
            },
            _ => {
                target.insert(key.clone(), incoming.clone());
            },
        }
    }
}
