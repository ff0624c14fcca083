use crate::{Error, Result};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Field every stored record carries to say which shape it was written in.
pub const SCHEMA_VERSION_FIELD: &str = "schema_version";

type RecordKey = (String, i32);

/// Migrates records of one collection from one schema version to the next.
pub trait Upcaster: Send + Sync {
    fn collection(&self) -> &str;
    fn from_version(&self) -> i32;
    fn to_version(&self) -> i32;
    /// Transform the record body into the new representation. The registry stamps
    /// `schema_version` afterwards, so the transform need not.
    fn upcast(&self, body: &Value) -> Result<Value>;
}

#[derive(Default, Clone)]
pub struct UpcasterRegistry {
    upcasters: HashMap<RecordKey, Arc<dyn Upcaster>>,
}

/// Version a record body declares; bodies without the field are version 1.
pub fn schema_version_of(body: &Value) -> i32 {
    body.get(SCHEMA_VERSION_FIELD)
        .and_then(Value::as_i64)
        .and_then(|v| i32::try_from(v).ok())
        .unwrap_or(1)
}

impl UpcasterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<U>(&mut self, upcaster: U)
    where
        U: Upcaster + 'static,
    {
        let key = (upcaster.collection().to_string(), upcaster.from_version());
        self.upcasters.insert(key, Arc::new(upcaster));
    }

    pub fn is_empty(&self) -> bool {
        self.upcasters.is_empty()
    }

    /// Bring `body` to the newest version this registry knows for `collection`.
    ///
    /// Returns the version the body ends at. Non-object bodies are left alone.
    pub fn upcast(&self, collection: &str, body: &mut Value) -> Result<i32> {
        if !body.is_object() {
            return Ok(schema_version_of(body));
        }

        let mut version = schema_version_of(body);
        let mut visited = HashSet::new();
        while let Some(upcaster) = self.upcasters.get(&(collection.to_string(), version)) {
            if !visited.insert(version) {
                return Err(Error::UpcastingCycle {
                    collection: collection.to_string(),
                    version,
                });
            }

            let mut next = upcaster.upcast(body)?;
            version = upcaster.to_version();
            if let Some(obj) = next.as_object_mut() {
                obj.insert(SCHEMA_VERSION_FIELD.to_string(), Value::from(version));
            } else {
                return Err(Error::Upcast {
                    collection: collection.to_string(),
                    version: upcaster.from_version(),
                    reason: "upcaster returned a non-object body".to_string(),
                });
            }
            *body = next;
        }

        Ok(version)
    }
}

/// Builder for closure-based upcasters, for cases too small to warrant a type.
pub struct UpcasterBuilder {
    collection: String,
    from_version: i32,
    to_version: i32,
    handler: Option<Box<dyn Fn(&Value) -> Result<Value> + Send + Sync>>,
}

impl UpcasterBuilder {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            from_version: 1,
            to_version: 2,
            handler: None,
        }
    }

    pub fn from_version(mut self, version: i32) -> Self {
        self.from_version = version;
        self
    }

    pub fn to_version(mut self, version: i32) -> Self {
        self.to_version = version;
        self
    }

    pub fn handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.handler = Some(Box::new(handler));
        self
    }

    pub fn build(self) -> Result<ClosureUpcaster> {
        let handler = self.handler.ok_or_else(|| Error::Upcast {
            collection: self.collection.clone(),
            version: self.from_version,
            reason: "missing handler".into(),
        })?;

        Ok(ClosureUpcaster {
            collection: self.collection,
            from_version: self.from_version,
            to_version: self.to_version,
            handler,
        })
    }
}

pub struct ClosureUpcaster {
    collection: String,
    from_version: i32,
    to_version: i32,
    handler: Box<dyn Fn(&Value) -> Result<Value> + Send + Sync>,
}

impl Upcaster for ClosureUpcaster {
    fn collection(&self) -> &str {
        &self.collection
    }

    fn from_version(&self) -> i32 {
        self.from_version
    }

    fn to_version(&self) -> i32 {
        self.to_version
    }

    fn upcast(&self, body: &Value) -> Result<Value> {
        (self.handler)(body)
    }
}

/// Build a [`ClosureUpcaster`] inline.
///
/// ```ignore
/// let up = record_upcaster!(from "faults", 1 => 2, |value| {
///     value["severity"] = serde_json::json!("minor");
///     Ok(value)
/// });
/// ```
#[macro_export]
macro_rules! record_upcaster {
    (from $collection:expr, $from_ver:expr => $to_ver:expr, |$val:ident| $body:block) => {{
        $crate::upcasting::UpcasterBuilder::new($collection)
            .from_version($from_ver)
            .to_version($to_ver)
            .handler(|value| {
                let mut $val = value.clone();
                $body
            })
            .build()
            .expect("invalid upcaster definition")
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct AddSeverity;

    impl Upcaster for AddSeverity {
        fn collection(&self) -> &str {
            "faults"
        }

        fn from_version(&self) -> i32 {
            1
        }

        fn to_version(&self) -> i32 {
            2
        }

        fn upcast(&self, body: &Value) -> Result<Value> {
            let mut updated = body.clone();
            updated["severity"] = json!("minor");
            Ok(updated)
        }
    }

    #[test]
    fn unversioned_record_is_treated_as_v1() {
        let mut registry = UpcasterRegistry::new();
        registry.register(AddSeverity);

        let mut body = json!({"title": "leak"});
        let version = registry.upcast("faults", &mut body).unwrap();

        assert_eq!(version, 2);
        assert_eq!(body["severity"], "minor");
        assert_eq!(body["schema_version"], 2);
    }

    #[test]
    fn current_records_and_other_collections_pass_through() {
        let mut registry = UpcasterRegistry::new();
        registry.register(AddSeverity);

        let mut current = json!({"schema_version": 2, "severity": "major"});
        assert_eq!(registry.upcast("faults", &mut current).unwrap(), 2);
        assert_eq!(current["severity"], "major");

        let mut other = json!({"title": "x"});
        registry.upcast("inspections", &mut other).unwrap();
        assert_eq!(other, json!({"title": "x"}));
    }

    #[test]
    fn chained_upcasters_run_in_order() {
        let mut registry = UpcasterRegistry::new();
        registry.register(AddSeverity);
        registry.register(record_upcaster!(from "faults", 2 => 3, |value| {
            value["tags"] = json!([]);
            Ok(value)
        }));

        let mut body = json!({});
        assert_eq!(registry.upcast("faults", &mut body).unwrap(), 3);
        assert_eq!(body["tags"], json!([]));
    }

    #[test]
    fn cycle_detection_errors() {
        let mut registry = UpcasterRegistry::new();
        registry.register(record_upcaster!(from "faults", 1 => 2, |value| { Ok(value) }));
        registry.register(record_upcaster!(from "faults", 2 => 1, |value| { Ok(value) }));

        let err = registry
            .upcast("faults", &mut json!({"schema_version": 1}))
            .unwrap_err();
        assert!(matches!(err, Error::UpcastingCycle { version: 1, .. }));
    }

    #[test]
    fn builder_requires_handler() {
        assert!(UpcasterBuilder::new("faults").build().is_err());
    }
}
