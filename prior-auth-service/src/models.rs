use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Placeholder used for every textual field the documents do not mention
pub const NOT_PROVIDED: &str = "Not provided";

/// Sentinel policy location when the search returned no hits
pub const NO_RESULTS_FOUND: &str = "no results found";
/// Sentinel policy location when the search call itself failed
pub const ERROR_LOCATING_POLICY: &str = "error locating policy";

fn not_provided() -> String {
    NOT_PROVIDED.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatientInformation {
    pub patient_name: String,
    pub patient_date_of_birth: String,
    pub patient_id: String,
    pub patient_address: String,
    pub patient_phone_number: String,
}

impl Default for PatientInformation {
    fn default() -> Self {
        Self {
            patient_name: not_provided(),
            patient_date_of_birth: not_provided(),
            patient_id: not_provided(),
            patient_address: not_provided(),
            patient_phone_number: not_provided(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhysicianContact {
    pub office_phone: String,
    pub fax: String,
    pub office_address: String,
}

impl Default for PhysicianContact {
    fn default() -> Self {
        Self {
            office_phone: not_provided(),
            fax: not_provided(),
            office_address: not_provided(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhysicianInformation {
    pub physician_name: String,
    pub specialty: String,
    pub physician_contact: PhysicianContact,
}

impl Default for PhysicianInformation {
    fn default() -> Self {
        Self {
            physician_name: not_provided(),
            specialty: not_provided(),
            physician_contact: PhysicianContact::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreatmentRequest {
    pub name_of_medication_or_procedure: String,
    pub code_of_medication_or_procedure: String,
    pub dosage: String,
    pub duration: String,
    pub rationale: String,
    pub presumed_eligibility: String,
}

impl Default for TreatmentRequest {
    fn default() -> Self {
        Self {
            name_of_medication_or_procedure: not_provided(),
            code_of_medication_or_procedure: not_provided(),
            dosage: not_provided(),
            duration: not_provided(),
            rationale: not_provided(),
            presumed_eligibility: not_provided(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClinicalInformation {
    pub diagnosis: String,
    pub icd_10_code: String,
    pub prior_treatments_and_results: String,
    pub specific_drugs_taken_and_failures: String,
    pub alternative_drugs_required: String,
    pub relevant_lab_results_or_imaging: String,
    pub symptom_severity_and_impact: String,
    pub prognosis_and_risk_if_not_approved: String,
    pub clinical_rationale_for_urgency: String,
    pub treatment_request: TreatmentRequest,
}

impl Default for ClinicalInformation {
    fn default() -> Self {
        Self {
            diagnosis: not_provided(),
            icd_10_code: not_provided(),
            prior_treatments_and_results: not_provided(),
            specific_drugs_taken_and_failures: not_provided(),
            alternative_drugs_required: not_provided(),
            relevant_lab_results_or_imaging: not_provided(),
            symptom_severity_and_impact: not_provided(),
            prognosis_and_risk_if_not_approved: not_provided(),
            clinical_rationale_for_urgency: not_provided(),
            treatment_request: TreatmentRequest::default(),
        }
    }
}

/// One rendered document page, PNG encoded as base64
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageImage {
    pub name: String,
    pub png_base64: String,
}

impl PageImage {
    pub fn new(name: impl Into<String>, png_base64: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            png_base64: png_base64.into(),
        }
    }

    pub fn data_url(&self) -> String {
        format!("data:image/png;base64,{}", self.png_base64)
    }
}

/// Result of the policy search: a storage path or one of the two sentinels
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyLocation {
    Found(String),
    NoResults,
    LocateError,
}

impl PolicyLocation {
    pub fn as_str(&self) -> &str {
        match self {
            PolicyLocation::Found(path) => path,
            PolicyLocation::NoResults => NO_RESULTS_FOUND,
            PolicyLocation::LocateError => ERROR_LOCATING_POLICY,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        !matches!(self, PolicyLocation::Found(_))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProcessRequest {
    pub uploaded_files: Vec<String>,
    #[serde(default)]
    pub case_id: Option<String>,
    #[serde(default)]
    pub use_reasoning: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProcessImagesRequest {
    #[serde(default)]
    pub case_id: Option<String>,
    pub images: Vec<String>,
    #[serde(default)]
    pub use_reasoning: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProcessResponse {
    pub case_id: String,
    pub status: String,
    pub message: Option<String>,
    pub elapsed_seconds: f64,
    pub results: Map<String, Value>,
}
