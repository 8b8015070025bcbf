//! Uniform navigation over JSON documents of unknown shape.
//!
//! Non-RTK devices publish payloads whose layout is only known to their
//! wrapper. [FlexPayload] gives the wrapper match engine and applications
//! a single way to probe such documents: dot-separated paths, `Option`
//! results, no failures on absent keys.

use serde_json::Value as JsonValue;

#[derive(Debug, Clone, PartialEq)]
pub struct FlexPayload(JsonValue);

impl FlexPayload {
    pub fn from_value(value: JsonValue) -> Self {
        FlexPayload(value)
    }

    pub fn from_slice(payload: &[u8]) -> Result<Self, serde_json::Error> {
        Ok(FlexPayload(serde_json::from_slice(payload)?))
    }

    pub fn as_value(&self) -> &JsonValue {
        &self.0
    }

    /// The value at the given dot-separated path, if present.
    pub fn get(&self, path: &str) -> Option<&JsonValue> {
        let mut value = &self.0;
        for key in path.split('.') {
            value = value.as_object()?.get(key)?;
        }
        Some(value)
    }

    pub fn has(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path)?.as_str()
    }

    pub fn get_f64(&self, path: &str) -> Option<f64> {
        self.get(path)?.as_f64()
    }

    pub fn get_i64(&self, path: &str) -> Option<i64> {
        self.get(path)?.as_i64()
    }

    pub fn get_bool(&self, path: &str) -> Option<bool> {
        self.get(path)?.as_bool()
    }

    /// The JSON type of the value at the path, if present.
    pub fn type_name(&self, path: &str) -> Option<&'static str> {
        Some(match self.get(path)? {
            JsonValue::Null => "null",
            JsonValue::Bool(_) => "bool",
            JsonValue::Number(_) => "number",
            JsonValue::String(_) => "string",
            JsonValue::Array(_) => "array",
            JsonValue::Object(_) => "object",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> FlexPayload {
        FlexPayload::from_value(json!({
            "state": "ON",
            "brightness": 128,
            "color": {"r": 255, "g": 128, "b": 0},
            "reachable": true,
        }))
    }

    #[test]
    fn top_level_keys_are_typed() {
        let payload = payload();
        assert_eq!(payload.get_str("state"), Some("ON"));
        assert_eq!(payload.get_f64("brightness"), Some(128.0));
        assert_eq!(payload.get_bool("reachable"), Some(true));
    }

    #[test]
    fn nested_paths_are_dot_separated() {
        let payload = payload();
        assert_eq!(payload.get_i64("color.r"), Some(255));
        assert!(payload.has("color.g"));
    }

    #[test]
    fn absent_keys_are_none_not_errors() {
        let payload = payload();
        assert_eq!(payload.get("nope"), None);
        assert_eq!(payload.get_str("color.alpha"), None);
        assert_eq!(payload.get_str("state.too.deep"), None);
    }

    #[test]
    fn type_mismatches_are_none() {
        let payload = payload();
        assert_eq!(payload.get_str("brightness"), None);
        assert_eq!(payload.get_bool("state"), None);
    }

    #[test]
    fn type_names_support_the_match_engine() {
        let payload = payload();
        assert_eq!(payload.type_name("state"), Some("string"));
        assert_eq!(payload.type_name("brightness"), Some("number"));
        assert_eq!(payload.type_name("color"), Some("object"));
        assert_eq!(payload.type_name("nope"), None);
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(FlexPayload::from_slice(b"{not json").is_err());
    }
}
