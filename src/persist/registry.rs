//! Tagged-variant encoding for status objects.
//!
//! Status objects are trait objects, so the persisted form records a type
//! tag (`__type__`) next to the fields. Restoring goes through an explicit
//! registry mapping tag → builder function: every instance is built through
//! its normal constructor path (serde deserialization), and a tag that was
//! never registered is a hard error rather than a silent guess.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::verify::status::{SimpleStatus, VerifierStatus};
use crate::verify::tree_status::TreeStatus;
use crate::verify::try_job::TryJobStatus;

use super::PersistError;

/// Key carrying the type tag in serialized status objects.
pub const TYPE_TAG: &str = "__type__";

/// Serializes `value` and stamps the type tag into the resulting object.
pub fn encode_tagged<T: Serialize>(tag: &'static str, value: &T) -> Result<Value, PersistError> {
    let mut encoded = serde_json::to_value(value)?;
    match encoded.as_object_mut() {
        Some(map) => {
            map.insert(TYPE_TAG.to_string(), Value::String(tag.to_string()));
            Ok(encoded)
        }
        None => Err(PersistError::NotAnObject { tag }),
    }
}

type StatusBuilder = fn(Value) -> Result<Box<dyn VerifierStatus>, PersistError>;

fn build<T>(fields: Value) -> Result<Box<dyn VerifierStatus>, PersistError>
where
    T: DeserializeOwned + VerifierStatus + 'static,
{
    Ok(Box::new(serde_json::from_value::<T>(fields)?))
}

/// Maps persisted type tags to status constructors.
///
/// Populated once at startup; [`StatusRegistry::decode`] fails fast on tags
/// that were never registered, so a snapshot written by a newer binary (or a
/// misconfigured one) is rejected instead of partially loaded.
pub struct StatusRegistry {
    builders: HashMap<&'static str, StatusBuilder>,
}

impl StatusRegistry {
    /// Registry with no known types. Useful only for tests.
    pub fn empty() -> Self {
        StatusRegistry {
            builders: HashMap::new(),
        }
    }

    /// Registry knowing every built-in status type.
    pub fn builtin() -> Self {
        let mut registry = StatusRegistry::empty();
        registry.register(SimpleStatus::TAG, build::<SimpleStatus>);
        registry.register(TreeStatus::TAG, build::<TreeStatus>);
        registry.register(TryJobStatus::TAG, build::<TryJobStatus>);
        registry
    }

    pub fn register(&mut self, tag: &'static str, builder: StatusBuilder) {
        self.builders.insert(tag, builder);
    }

    /// Rebuilds a status object from its tagged serialized form.
    pub fn decode(&self, value: &Value) -> Result<Box<dyn VerifierStatus>, PersistError> {
        let tag = value
            .get(TYPE_TAG)
            .and_then(Value::as_str)
            .ok_or(PersistError::MissingTypeTag)?;
        let builder = self
            .builders
            .get(tag)
            .ok_or_else(|| PersistError::UnknownType {
                tag: tag.to_string(),
            })?;
        let mut fields = value.clone();
        if let Some(map) = fields.as_object_mut() {
            map.remove(TYPE_TAG);
        }
        builder(fields)
    }
}

impl Default for StatusRegistry {
    fn default() -> Self {
        StatusRegistry::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::VerifierState;

    #[test]
    fn decode_round_trips_every_builtin_variant() {
        let registry = StatusRegistry::builtin();
        let statuses: Vec<Box<dyn VerifierStatus>> = vec![
            Box::new(SimpleStatus::failed("broken")),
            Box::new(TreeStatus::new("http://status.example.com")),
            Box::new(TryJobStatus::for_builders(&["linux_rel".to_string()])),
        ];
        for status in statuses {
            let encoded = status.encode().unwrap();
            let decoded = registry.decode(&encoded).unwrap();
            assert_eq!(decoded.type_tag(), status.type_tag());
            assert_eq!(decoded.state(), status.state());
            assert_eq!(decoded.encode().unwrap(), encoded);
        }
    }

    #[test]
    fn unknown_tag_fails_fast() {
        let registry = StatusRegistry::builtin();
        let value = serde_json::json!({ TYPE_TAG: "no_such_status" });
        match registry.decode(&value) {
            Err(PersistError::UnknownType { tag }) => assert_eq!(tag, "no_such_status"),
            other => panic!("expected UnknownType, got {:?}", other.map(|s| s.type_tag())),
        }
    }

    #[test]
    fn missing_tag_is_an_error() {
        let registry = StatusRegistry::builtin();
        let value = serde_json::json!({ "state": "succeeded" });
        assert!(matches!(
            registry.decode(&value),
            Err(PersistError::MissingTypeTag)
        ));
    }

    #[test]
    fn empty_registry_knows_nothing() {
        let registry = StatusRegistry::empty();
        let encoded = SimpleStatus::new(VerifierState::Succeeded).encode().unwrap();
        assert!(matches!(
            registry.decode(&encoded),
            Err(PersistError::UnknownType { .. })
        ));
    }
}
