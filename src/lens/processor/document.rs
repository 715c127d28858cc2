use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A record flowing through a processor
///
/// Fields are addressed by dotted paths (`"client.ip"`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document {
    source: Map<String, Value>,
}

impl Document {
    pub fn new(source: Map<String, Value>) -> Self {
        Self { source }
    }

    /// Build from a JSON value; `None` unless it is an object
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(source) => Some(Self::new(source)),
            _ => None,
        }
    }

    pub fn source(&self) -> &Map<String, Value> {
        &self.source
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.source)
    }

    pub fn get_field(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.source.get(first)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    pub fn has_field(&self, path: &str) -> bool {
        self.get_field(path).is_some()
    }

    /// Set the value at `path`, creating intermediate objects
    ///
    /// An intermediate that is not an object is replaced by one.
    pub fn set_field(&mut self, path: &str, value: Value) {
        let mut segments: Vec<&str> = path.split('.').collect();
        let Some(leaf) = segments.pop() else {
            return;
        };

        let mut current = &mut self.source;
        for segment in segments {
            let slot = current
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            current = match slot {
                Value::Object(map) => map,
                _ => return,
            };
        }
        current.insert(leaf.to_string(), value);
    }
}

impl From<Map<String, Value>> for Document {
    fn from(source: Map<String, Value>) -> Self {
        Self::new(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        Document::from_value(value).unwrap()
    }

    #[test]
    fn test_get_nested_field() {
        let d = doc(json!({"client": {"ip": "1.1.1.1"}, "ip": "8.8.8.8"}));
        assert_eq!(d.get_field("ip"), Some(&json!("8.8.8.8")));
        assert_eq!(d.get_field("client.ip"), Some(&json!("1.1.1.1")));
        assert!(d.get_field("client.port").is_none());
        assert!(d.get_field("ip.inner").is_none());
        assert!(!d.has_field("missing"));
    }

    #[test]
    fn test_set_creates_parents() {
        let mut d = Document::default();
        d.set_field("geo.location", json!({"country": "US"}));
        assert_eq!(d.into_value(), json!({"geo": {"location": {"country": "US"}}}));
    }

    #[test]
    fn test_set_replaces_scalar_parent() {
        let mut d = doc(json!({"geo": "unknown", "other": 1}));
        d.set_field("geo.country", json!("US"));
        assert_eq!(d.into_value(), json!({"geo": {"country": "US"}, "other": 1}));
    }

    #[test]
    fn test_from_value_rejects_non_object() {
        assert!(Document::from_value(json!([1, 2])).is_none());
    }
}
