//! Schema identifiers and the declarative schema registry.
//!
//! A schema id names a payload layout and its version: `<kind>[.<sub>]/<major>.<minor>`,
//! e.g. `evt.wifi.roam_miss/1.0`. The registry maps schema ids to field
//! descriptors used to validate decoded payloads. It is an explicit value
//! owned by the codec, not a process-wide singleton, so parallel
//! controllers can run with distinct registries.

use crate::flex::FlexPayload;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt::Display;
use std::fmt::Formatter;
use std::ops::RangeInclusive;
use std::str::FromStr;

/// A schema identifier: `<kind>[.<sub>]/<major>.<minor>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SchemaId {
    path: String,
    major: u16,
    minor: u16,
}

impl SchemaId {
    pub fn new(path: impl Into<String>, major: u16, minor: u16) -> Self {
        SchemaId {
            path: path.into(),
            major,
            minor,
        }
    }

    /// The dotted kind path, e.g. `evt.wifi.roam_miss`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The topic kind this schema belongs to: the path up to the first dot.
    pub fn kind(&self) -> &str {
        self.path.split('.').next().unwrap_or(&self.path)
    }

    pub fn major(&self) -> u16 {
        self.major
    }

    pub fn minor(&self) -> u16 {
        self.minor
    }

    /// The same version under the bare kind path, e.g.
    /// `telemetry.cpu/1.0` -> `telemetry/1.0`.
    pub fn base(&self) -> SchemaId {
        SchemaId::new(self.kind(), self.major, self.minor)
    }
}

impl Display for SchemaId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}.{}", self.path, self.major, self.minor)
    }
}

impl FromStr for SchemaId {
    type Err = SchemaIdError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let malformed = || SchemaIdError {
            input: input.to_string(),
        };
        let (path, version) = input.rsplit_once('/').ok_or_else(malformed)?;
        let (major, minor) = version.split_once('.').ok_or_else(malformed)?;
        if path.is_empty() {
            return Err(malformed());
        }
        Ok(SchemaId {
            path: path.to_string(),
            major: major.parse().map_err(|_| malformed())?,
            minor: minor.parse().map_err(|_| malformed())?,
        })
    }
}

impl TryFrom<String> for SchemaId {
    type Error = SchemaIdError;

    fn try_from(input: String) -> Result<Self, Self::Error> {
        input.parse()
    }
}

impl From<SchemaId> for String {
    fn from(id: SchemaId) -> String {
        id.to_string()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone)]
#[error("Invalid schema id, expected <kind>[.<sub>]/<major>.<minor>: {input:?}")]
pub struct SchemaIdError {
    pub input: String,
}

/// The JSON type a field is expected to have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Number,
    Integer,
    Bool,
    Object,
    Array,
}

impl FieldType {
    fn accepts(&self, value: &JsonValue) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Integer => "integer",
            FieldType::Bool => "bool",
            FieldType::Object => "object",
            FieldType::Array => "array",
        }
    }
}

/// Declarative constraints on one payload field.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    /// Dot-separated path into the payload document.
    pub path: String,
    pub field_type: FieldType,
    pub required: bool,

    /// Allowed values, for enumerated string fields.
    pub one_of: Option<Vec<String>>,

    /// Allowed numeric range, inclusive.
    pub range: Option<RangeInclusive<f64>>,
}

impl FieldSpec {
    pub fn required(path: &str, field_type: FieldType) -> Self {
        FieldSpec {
            path: path.to_string(),
            field_type,
            required: true,
            one_of: None,
            range: None,
        }
    }

    pub fn optional(path: &str, field_type: FieldType) -> Self {
        FieldSpec {
            required: false,
            ..FieldSpec::required(path, field_type)
        }
    }

    pub fn one_of(mut self, values: &[&str]) -> Self {
        self.one_of = Some(values.iter().map(|v| v.to_string()).collect());
        self
    }

    pub fn in_range(mut self, range: RangeInclusive<f64>) -> Self {
        self.range = Some(range);
        self
    }
}

/// The declarative description of one schema version.
#[derive(Debug, Clone, Default)]
pub struct SchemaDescriptor {
    pub fields: Vec<FieldSpec>,
}

impl SchemaDescriptor {
    pub fn with_fields(fields: Vec<FieldSpec>) -> Self {
        SchemaDescriptor { fields }
    }

    /// Check the payload against every field constraint, reporting the
    /// first violation with the offending field path.
    pub fn validate(&self, payload: &JsonValue) -> Result<(), ValidationError> {
        let flex = FlexPayload::from_value(payload.clone());
        for field in &self.fields {
            let Some(value) = flex.get(&field.path) else {
                if field.required {
                    return Err(ValidationError::Missing {
                        path: field.path.clone(),
                    });
                }
                continue;
            };

            if !field.field_type.accepts(value) {
                return Err(ValidationError::Type {
                    path: field.path.clone(),
                    expected: field.field_type.name(),
                });
            }

            if let Some(allowed) = &field.one_of {
                let matches = value
                    .as_str()
                    .map(|v| allowed.iter().any(|a| a == v))
                    .unwrap_or(false);
                if !matches {
                    return Err(ValidationError::Enum {
                        path: field.path.clone(),
                        allowed: allowed.join(", "),
                    });
                }
            }

            if let Some(range) = &field.range {
                let in_range = value
                    .as_f64()
                    .map(|v| range.contains(&v))
                    .unwrap_or(false);
                if !in_range {
                    return Err(ValidationError::Range {
                        path: field.path.clone(),
                        min: *range.start(),
                        max: *range.end(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Clone)]
pub enum ValidationError {
    #[error("Required field is missing: {path}")]
    Missing { path: String },

    #[error("Field {path} is not a {expected}")]
    Type { path: String, expected: &'static str },

    #[error("Field {path} is none of: {allowed}")]
    Enum { path: String, allowed: String },

    #[error("Field {path} is out of range [{min}, {max}]")]
    Range { path: String, min: f64, max: f64 },
}

/// How a schema id relates to the registered schemas.
#[derive(Debug)]
pub enum SchemaLookup<'a> {
    /// The exact id is registered: validate strictly.
    Exact(&'a SchemaDescriptor),

    /// The id falls back to its bare-kind descriptor of the same major
    /// (e.g. `telemetry.cpu/1.0` -> `telemetry/1.0`): validate strictly.
    BaseKind(&'a SchemaDescriptor),

    /// The path is known with this major version but not this exact minor:
    /// decode best-effort, no strict validation.
    KnownMajor,

    /// Neither the path nor the major version is known.
    Unsupported,
}

/// A registry of schema descriptors keyed by schema id.
#[derive(Debug, Default, Clone)]
pub struct SchemaRegistry {
    schemas: HashMap<SchemaId, SchemaDescriptor>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        SchemaRegistry::default()
    }

    /// A registry pre-loaded with the builtin RTK schemas.
    pub fn with_default_schemas() -> Self {
        let mut registry = SchemaRegistry::new();
        registry.register_default_schemas();
        registry
    }

    pub fn register(&mut self, id: SchemaId, descriptor: SchemaDescriptor) {
        self.schemas.insert(id, descriptor);
    }

    pub fn contains(&self, id: &SchemaId) -> bool {
        self.schemas.contains_key(id)
    }

    pub fn resolve(&self, id: &SchemaId) -> SchemaLookup<'_> {
        if let Some(descriptor) = self.schemas.get(id) {
            return SchemaLookup::Exact(descriptor);
        }

        let base = id.base();
        if base != *id {
            if let Some(descriptor) = self.schemas.get(&base) {
                return SchemaLookup::BaseKind(descriptor);
            }
        }

        let known_major = self.schemas.keys().any(|known| {
            (known.path() == id.path() || known.path() == id.kind())
                && known.major() == id.major()
        });
        if known_major {
            SchemaLookup::KnownMajor
        } else {
            SchemaLookup::Unsupported
        }
    }

    fn register_default_schemas(&mut self) {
        let status_values = ["online", "offline", "degraded"];
        let health_values = ["healthy", "warning", "error"];
        let level_values = ["info", "warning", "error", "critical"];

        self.register(
            SchemaId::new("state", 1, 0),
            SchemaDescriptor::with_fields(vec![
                FieldSpec::required("status", FieldType::String).one_of(&status_values),
                FieldSpec::required("health", FieldType::String).one_of(&health_values),
                FieldSpec::optional("uptime", FieldType::Number),
                FieldSpec::optional("last_seen", FieldType::Integer),
                FieldSpec::optional("properties", FieldType::Object),
            ]),
        );

        self.register(
            SchemaId::new("telemetry", 1, 0),
            SchemaDescriptor::with_fields(vec![
                FieldSpec::required("metric", FieldType::String),
                FieldSpec::required("value", FieldType::Number),
                FieldSpec::optional("unit", FieldType::String),
                FieldSpec::required("timestamp", FieldType::Integer),
                FieldSpec::optional("labels", FieldType::Object),
            ]),
        );

        let event_fields = || {
            vec![
                FieldSpec::required("id", FieldType::String),
                FieldSpec::required("type", FieldType::String),
                FieldSpec::required("level", FieldType::String).one_of(&level_values),
                FieldSpec::required("message", FieldType::String),
                FieldSpec::required("timestamp", FieldType::Integer),
            ]
        };
        self.register(
            SchemaId::new("evt", 1, 0),
            SchemaDescriptor::with_fields(event_fields()),
        );
        for event_type in ["wifi.roam_miss", "wifi.conn_fail", "net.arp_loss"] {
            self.register(
                SchemaId::new(format!("evt.{event_type}"), 1, 0),
                SchemaDescriptor::with_fields(event_fields()),
            );
        }

        self.register(
            SchemaId::new("cmd.req", 1, 0),
            SchemaDescriptor::with_fields(vec![
                FieldSpec::required("id", FieldType::String),
                FieldSpec::required("op", FieldType::String),
                FieldSpec::required("timeout_ms", FieldType::Integer)
                    .in_range(0.0..=86_400_000.0),
                FieldSpec::required("expect", FieldType::String).one_of(&["ack", "result"]),
            ]),
        );
        self.register(
            SchemaId::new("cmd.ack", 1, 0),
            SchemaDescriptor::with_fields(vec![
                FieldSpec::required("id", FieldType::String),
                FieldSpec::required("accepted", FieldType::Bool),
                FieldSpec::optional("estimated_completion_ms", FieldType::Integer),
                FieldSpec::optional("err", FieldType::String),
            ]),
        );
        self.register(
            SchemaId::new("cmd.res", 1, 0),
            SchemaDescriptor::with_fields(vec![
                FieldSpec::required("id", FieldType::String),
                FieldSpec::required("ok", FieldType::Bool),
                FieldSpec::optional("err", FieldType::String),
            ]),
        );

        self.register(SchemaId::new("attr", 1, 0), SchemaDescriptor::default());
        self.register(
            SchemaId::new("lwt", 1, 0),
            SchemaDescriptor::with_fields(vec![FieldSpec::required(
                "status",
                FieldType::String,
            )
            .one_of(&["offline"])]),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn schema_ids_round_trip() {
        for input in ["state/1.0", "evt.wifi.roam_miss/1.0", "telemetry.cpu/2.13"] {
            let id: SchemaId = input.parse().unwrap();
            assert_eq!(id.to_string(), input);
        }
    }

    #[test]
    fn malformed_schema_ids_are_rejected() {
        for input in ["state", "state/1", "/1.0", "state/x.y", "state/1.0.0"] {
            assert!(input.parse::<SchemaId>().is_err(), "accepted {input:?}");
        }
    }

    #[test]
    fn the_kind_is_the_first_path_segment() {
        let id: SchemaId = "evt.wifi.roam_miss/1.0".parse().unwrap();
        assert_eq!(id.kind(), "evt");
        assert_eq!(id.base(), SchemaId::new("evt", 1, 0));
    }

    #[test]
    fn missing_required_fields_are_reported_with_their_path() {
        let descriptor = SchemaDescriptor::with_fields(vec![
            FieldSpec::required("metric", FieldType::String),
            FieldSpec::required("value", FieldType::Number),
        ]);

        let err = descriptor.validate(&json!({"metric": "cpu"})).unwrap_err();
        assert_eq!(
            err,
            ValidationError::Missing {
                path: "value".to_string()
            }
        );
    }

    #[test]
    fn type_mismatches_are_reported() {
        let descriptor =
            SchemaDescriptor::with_fields(vec![FieldSpec::required("value", FieldType::Number)]);

        assert_matches!(
            descriptor.validate(&json!({"value": "not a number"})),
            Err(ValidationError::Type { .. })
        );
    }

    #[test]
    fn enums_and_ranges_are_enforced() {
        let descriptor = SchemaDescriptor::with_fields(vec![
            FieldSpec::required("level", FieldType::String).one_of(&["info", "error"]),
            FieldSpec::optional("score", FieldType::Number).in_range(0.0..=1.0),
        ]);

        assert_matches!(
            descriptor.validate(&json!({"level": "chatty"})),
            Err(ValidationError::Enum { .. })
        );
        assert_matches!(
            descriptor.validate(&json!({"level": "info", "score": 1.5})),
            Err(ValidationError::Range { .. })
        );
        assert!(descriptor
            .validate(&json!({"level": "info", "score": 0.5}))
            .is_ok());
    }

    #[test]
    fn nested_paths_are_navigated() {
        let descriptor = SchemaDescriptor::with_fields(vec![FieldSpec::required(
            "data.client_mac",
            FieldType::String,
        )]);

        assert!(descriptor
            .validate(&json!({"data": {"client_mac": "aa:bb"}}))
            .is_ok());
        assert_matches!(
            descriptor.validate(&json!({"data": {}})),
            Err(ValidationError::Missing { .. })
        );
    }

    #[test]
    fn unknown_metrics_fall_back_to_the_base_telemetry_schema() {
        let registry = SchemaRegistry::with_default_schemas();
        let id: SchemaId = "telemetry.cpu_usage/1.0".parse().unwrap();
        assert_matches!(registry.resolve(&id), SchemaLookup::BaseKind(_));
    }

    #[test]
    fn unknown_minor_versions_decode_best_effort() {
        let registry = SchemaRegistry::with_default_schemas();
        let id: SchemaId = "state/1.4".parse().unwrap();
        assert_matches!(registry.resolve(&id), SchemaLookup::KnownMajor);
    }

    #[test]
    fn unknown_major_versions_are_unsupported() {
        let registry = SchemaRegistry::with_default_schemas();
        assert_matches!(
            registry.resolve(&"state/9.0".parse().unwrap()),
            SchemaLookup::Unsupported
        );
        assert_matches!(
            registry.resolve(&"mystery/1.0".parse().unwrap()),
            SchemaLookup::Unsupported
        );
    }
}
