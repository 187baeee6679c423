//! Field-level validation of model output against a declared record shape.
//!
//! Each record type publishes a table of [`FieldSpec`]s. [`validate`] checks
//! the raw mapping one field at a time, substitutes a default for every field
//! that does not fit, and only then builds the typed record. A bad field never
//! poisons the rest of the record.

use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use crate::models::{
    ClinicalInformation, NOT_PROVIDED, PatientInformation, PhysicianContact,
    PhysicianInformation, TreatmentRequest,
};

#[derive(Error, Debug)]
pub enum SchemaError {
    /// The repaired mapping still could not be turned into the record
    #[error("Failed to construct {schema}: {message}")]
    Construction {
        schema: &'static str,
        message: String,
    },
}

impl From<SchemaError> for pa_flow::FlowError {
    fn from(err: SchemaError) -> Self {
        pa_flow::FlowError::StageFailed(err.to_string())
    }
}

/// Declared type of a field
#[derive(Clone, Copy)]
pub enum FieldKind {
    Text,
    Integer,
    Float,
    Boolean,
    List,
    Mapping,
    /// Nested record; the function checks a candidate value and returns it
    /// normalized (missing nested fields filled in)
    Record(fn(Value) -> Result<Value, String>),
    /// Anything else; only `null` is accepted
    Other,
}

/// Statically declared default for a field
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StaticDefault {
    Text(&'static str),
    Integer(i64),
    Float(f64),
    Boolean(bool),
}

impl StaticDefault {
    fn to_value(self) -> Value {
        match self {
            StaticDefault::Text(s) => Value::String(s.to_string()),
            StaticDefault::Integer(i) => Value::from(i),
            StaticDefault::Float(f) => Value::from(f),
            StaticDefault::Boolean(b) => Value::Bool(b),
        }
    }
}

#[derive(Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub alias: Option<&'static str>,
    pub kind: FieldKind,
    pub default: Option<StaticDefault>,
    pub default_factory: Option<fn() -> Value>,
}

impl FieldSpec {
    /// Key the field is looked up under in raw input
    pub fn external_name(&self) -> &'static str {
        self.alias.unwrap_or(self.name)
    }

    /// Text field defaulting to the "Not provided" placeholder
    pub const fn text(name: &'static str) -> Self {
        Self {
            name,
            alias: None,
            kind: FieldKind::Text,
            default: Some(StaticDefault::Text(NOT_PROVIDED)),
            default_factory: None,
        }
    }

    /// Nested record field whose default comes from the record's own defaults
    pub const fn record(
        name: &'static str,
        check: fn(Value) -> Result<Value, String>,
        factory: fn() -> Value,
    ) -> Self {
        Self {
            name,
            alias: None,
            kind: FieldKind::Record(check),
            default: None,
            default_factory: Some(factory),
        }
    }
}

/// A record type the validator can build
pub trait Schema: Serialize + DeserializeOwned + Default {
    const NAME: &'static str;
    fn fields() -> &'static [FieldSpec];
}

/// Check that `value` deserializes as `T`; return it in normalized form
pub fn nested<T: Serialize + DeserializeOwned>(value: Value) -> Result<Value, String> {
    let record: T = serde_json::from_value(value).map_err(|e| e.to_string())?;
    serde_json::to_value(record).map_err(|e| e.to_string())
}

pub fn default_value<T: Serialize + Default>() -> Value {
    serde_json::to_value(T::default()).unwrap_or(Value::Null)
}

fn check_field(kind: FieldKind, value: Value) -> Result<Value, String> {
    match (kind, value) {
        (FieldKind::Text, Value::String(s)) => Ok(Value::String(s)),
        // integer fields are i64; larger unsigned values are out of range
        (FieldKind::Integer, Value::Number(n)) if n.is_i64() => Ok(Value::Number(n)),
        (FieldKind::Integer, Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|e| format!("'{}' is not an integer: {}", s, e)),
        (FieldKind::Float, Value::Number(n)) => n
            .as_f64()
            .map(Value::from)
            .ok_or_else(|| format!("{} is not a float", n)),
        (FieldKind::Float, Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(Value::from)
            .map_err(|e| format!("'{}' is not a float: {}", s, e)),
        (FieldKind::Boolean, Value::Bool(b)) => Ok(Value::Bool(b)),
        (FieldKind::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Ok(Value::Bool(true)),
            "false" | "no" | "0" => Ok(Value::Bool(false)),
            _ => Err(format!("'{}' is not a boolean", s)),
        },
        (FieldKind::List, Value::Array(items)) => Ok(Value::Array(items)),
        (FieldKind::Mapping, Value::Object(map)) => Ok(Value::Object(map)),
        (FieldKind::Record(check), value) => check(value),
        (FieldKind::Other, Value::Null) => Ok(Value::Null),
        (_, value) => Err(format!("unexpected value {}", value)),
    }
}

fn fallback_for(field: &FieldSpec) -> Value {
    if let Some(default) = field.default {
        return default.to_value();
    }
    if let Some(factory) = field.default_factory {
        return factory();
    }
    match field.kind {
        FieldKind::Text => Value::String(NOT_PROVIDED.to_string()),
        FieldKind::Integer => Value::from(0),
        FieldKind::Float => Value::from(0.0),
        FieldKind::Boolean => Value::Bool(false),
        FieldKind::List => Value::Array(Vec::new()),
        FieldKind::Mapping => Value::Object(Map::new()),
        FieldKind::Record(_) | FieldKind::Other => Value::Null,
    }
}

/// Build a `T` from untrusted generated output.
///
/// Each declared field is read from `raw` under its external name. A field
/// that is missing or has the wrong shape is replaced, in order of
/// preference, by its static default, its default factory, or the fallback
/// for its declared kind. A non-mapping `raw` is treated as empty.
///
/// Only the final construction can fail.
pub fn validate<T: Schema>(raw: &Value) -> Result<T, SchemaError> {
    let empty = Map::new();
    let input = raw.as_object().unwrap_or(&empty);

    let mut repaired = Map::new();
    for field in T::fields() {
        let key = field.external_name();
        let candidate = input.get(key).cloned().unwrap_or(Value::Null);

        let value = match check_field(field.kind, candidate) {
            Ok(value) => value,
            Err(reason) => {
                warn!(schema = T::NAME, field = key, error = %reason, "Validation error, using default");
                fallback_for(field)
            }
        };
        repaired.insert(key.to_string(), value);
    }

    serde_json::from_value(Value::Object(repaired)).map_err(|e| SchemaError::Construction {
        schema: T::NAME,
        message: e.to_string(),
    })
}

static PATIENT_FIELDS: [FieldSpec; 5] = [
    FieldSpec::text("patient_name"),
    FieldSpec::text("patient_date_of_birth"),
    FieldSpec::text("patient_id"),
    FieldSpec::text("patient_address"),
    FieldSpec::text("patient_phone_number"),
];

static PHYSICIAN_CONTACT_FIELDS: [FieldSpec; 3] = [
    FieldSpec::text("office_phone"),
    FieldSpec::text("fax"),
    FieldSpec::text("office_address"),
];

static PHYSICIAN_FIELDS: [FieldSpec; 3] = [
    FieldSpec::text("physician_name"),
    FieldSpec::text("specialty"),
    FieldSpec::record(
        "physician_contact",
        nested::<PhysicianContact>,
        default_value::<PhysicianContact>,
    ),
];

static TREATMENT_REQUEST_FIELDS: [FieldSpec; 6] = [
    FieldSpec::text("name_of_medication_or_procedure"),
    FieldSpec::text("code_of_medication_or_procedure"),
    FieldSpec::text("dosage"),
    FieldSpec::text("duration"),
    FieldSpec::text("rationale"),
    FieldSpec::text("presumed_eligibility"),
];

static CLINICAL_FIELDS: [FieldSpec; 10] = [
    FieldSpec::text("diagnosis"),
    FieldSpec::text("icd_10_code"),
    FieldSpec::text("prior_treatments_and_results"),
    FieldSpec::text("specific_drugs_taken_and_failures"),
    FieldSpec::text("alternative_drugs_required"),
    FieldSpec::text("relevant_lab_results_or_imaging"),
    FieldSpec::text("symptom_severity_and_impact"),
    FieldSpec::text("prognosis_and_risk_if_not_approved"),
    FieldSpec::text("clinical_rationale_for_urgency"),
    FieldSpec::record(
        "treatment_request",
        nested::<TreatmentRequest>,
        default_value::<TreatmentRequest>,
    ),
];

impl Schema for PatientInformation {
    const NAME: &'static str = "PatientInformation";
    fn fields() -> &'static [FieldSpec] {
        &PATIENT_FIELDS
    }
}

impl Schema for PhysicianContact {
    const NAME: &'static str = "PhysicianContact";
    fn fields() -> &'static [FieldSpec] {
        &PHYSICIAN_CONTACT_FIELDS
    }
}

impl Schema for PhysicianInformation {
    const NAME: &'static str = "PhysicianInformation";
    fn fields() -> &'static [FieldSpec] {
        &PHYSICIAN_FIELDS
    }
}

impl Schema for TreatmentRequest {
    const NAME: &'static str = "TreatmentRequest";
    fn fields() -> &'static [FieldSpec] {
        &TREATMENT_REQUEST_FIELDS
    }
}

impl Schema for ClinicalInformation {
    const NAME: &'static str = "ClinicalInformation";
    fn fields() -> &'static [FieldSpec] {
        &CLINICAL_FIELDS
    }
}
