use serde::{Deserialize, Serialize};

use crate::models::{ClinicalInformation, PatientInformation, PhysicianInformation};

pub const PATIENT_SYSTEM_PROMPT: &str = "You are an expert in reading prior authorization forms and clinical notes. \
Extract the patient's identifying information from the provided page images. \
Answer with a single JSON object and nothing else.";

pub const PATIENT_USER_PROMPT: &str = r#"Extract the following patient fields from the attached pages:
- patient_name
- patient_date_of_birth
- patient_id
- patient_address
- patient_phone_number

Return a JSON object with exactly these keys. Use "Not provided" for any value that does not appear in the documents."#;

pub const PHYSICIAN_SYSTEM_PROMPT: &str = "You are an expert in reading prior authorization forms and clinical notes. \
Extract the information about the requesting physician from the provided page images. \
Answer with a single JSON object and nothing else.";

pub const PHYSICIAN_USER_PROMPT: &str = r#"Extract the following physician fields from the attached pages:
- physician_name
- specialty
- physician_contact: an object with office_phone, fax and office_address

Return a JSON object with exactly these keys. Use "Not provided" for any value that does not appear in the documents."#;

pub const CLINICAL_SYSTEM_PROMPT: &str = "You are a clinical reviewer preparing a prior authorization case. \
Extract the clinical facts supporting the request from the provided page images. \
Quote the documents where possible and answer with a single JSON object and nothing else.";

pub const CLINICAL_USER_PROMPT: &str = r#"Extract the following clinical fields from the attached pages:
- diagnosis
- icd_10_code
- prior_treatments_and_results
- specific_drugs_taken_and_failures
- alternative_drugs_required
- relevant_lab_results_or_imaging
- symptom_severity_and_impact
- prognosis_and_risk_if_not_approved
- clinical_rationale_for_urgency
- treatment_request: an object with name_of_medication_or_procedure, code_of_medication_or_procedure, dosage, duration, rationale and presumed_eligibility

Return a JSON object with exactly these keys. Use "Not provided" for any value that does not appear in the documents."#;

pub const QUERY_EXPANSION_SYSTEM_PROMPT: &str = "You build search queries for an index of payer prior authorization policies. \
Given a diagnosis and a requested treatment, write one concise query that combines the drug or procedure name, \
its codes, the condition and useful synonyms. Answer with a JSON object of the form {\"optimized_query\": \"...\"}.";

pub const QUERY_EXPANSION_USER_PROMPT: &str = r#"Diagnosis: {{diagnosis}}
Medication or procedure: {{medication_or_procedure}}
Code: {{code}}
Dosage: {{dosage}}
Duration: {{duration}}
Rationale: {{rationale}}

Write the optimized policy search query."#;

pub const PRIOR_AUTH_SYSTEM_PROMPT: &str = "You are a utilization management reviewer. \
Compare the clinical information of a prior authorization request against the payer policy, \
criterion by criterion, and reach a final determination of APPROVED, DENIED or NEEDS MORE INFORMATION. \
Cite the policy text and the clinical evidence for every criterion.";

pub const PRIOR_AUTH_USER_PROMPT: &str = r#"## Patient
Name: {{patient_name}}
Date of birth: {{patient_dob}}
ID: {{patient_id}}
Address: {{patient_address}}
Phone: {{patient_phone}}

## Physician
Name: {{physician_name}}
Specialty: {{specialty}}
Phone: {{physician_phone}}
Fax: {{physician_fax}}
Address: {{physician_address}}

## Clinical information
Diagnosis: {{diagnosis}}
ICD-10: {{icd10_code}}
Prior treatments and results: {{prior_treatments}}
Specific drugs taken and failures: {{specific_drugs}}
Alternative drugs required: {{alternative_drugs_required}}
Labs and imaging: {{lab_results}}
Symptom severity and impact: {{symptom_severity}}
Prognosis and risk if not approved: {{prognosis_risk}}
Rationale for urgency: {{urgency_rationale}}

## Treatment request
Medication or procedure: {{requested_medication}}
Code: {{medication_code}}
Dosage: {{dosage}}
Duration: {{treatment_duration}}
Rationale: {{medication_rationale}}
Presumed eligibility: {{presumed_eligibility}}

## Policy
{{policy_text}}

Evaluate each policy criterion against the clinical information and give the final determination."#;

/// Reasoning models get no system message, so the reviewer instructions are
/// folded into the single user prompt
pub const PRIOR_AUTH_REASONING_USER_PROMPT: &str = r#"You are a utilization management reviewer deciding a prior authorization request.

{{case_details}}

Work through every policy criterion, state whether the clinical evidence meets it, and end with a line
"Final Determination: APPROVED", "Final Determination: DENIED" or "Final Determination: NEEDS MORE INFORMATION"."#;

pub const SUMMARIZE_POLICY_SYSTEM_PROMPT: &str = "You condense payer policies. \
Keep every coverage criterion, step therapy requirement, quantity limit, exclusion and code exactly; drop boilerplate.";

pub const SUMMARIZE_POLICY_USER_PROMPT: &str = r#"Summarize the following prior authorization policy, preserving all criteria:

{{policy_text}}"#;

/// Prompt templates used by the pipeline. Placeholders are written
/// `{{name}}`; unknown placeholders are left as they are.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Prompts {
    pub patient_system: String,
    pub patient_user: String,
    pub physician_system: String,
    pub physician_user: String,
    pub clinical_system: String,
    pub clinical_user: String,
    pub query_expansion_system: String,
    pub query_expansion_user: String,
    pub prior_auth_system: String,
    pub prior_auth_user: String,
    pub prior_auth_reasoning_user: String,
    pub summarize_policy_system: String,
    pub summarize_policy_user: String,
}

impl Default for Prompts {
    fn default() -> Self {
        Self {
            patient_system: PATIENT_SYSTEM_PROMPT.to_string(),
            patient_user: PATIENT_USER_PROMPT.to_string(),
            physician_system: PHYSICIAN_SYSTEM_PROMPT.to_string(),
            physician_user: PHYSICIAN_USER_PROMPT.to_string(),
            clinical_system: CLINICAL_SYSTEM_PROMPT.to_string(),
            clinical_user: CLINICAL_USER_PROMPT.to_string(),
            query_expansion_system: QUERY_EXPANSION_SYSTEM_PROMPT.to_string(),
            query_expansion_user: QUERY_EXPANSION_USER_PROMPT.to_string(),
            prior_auth_system: PRIOR_AUTH_SYSTEM_PROMPT.to_string(),
            prior_auth_user: PRIOR_AUTH_USER_PROMPT.to_string(),
            prior_auth_reasoning_user: PRIOR_AUTH_REASONING_USER_PROMPT.to_string(),
            summarize_policy_system: SUMMARIZE_POLICY_SYSTEM_PROMPT.to_string(),
            summarize_policy_user: SUMMARIZE_POLICY_USER_PROMPT.to_string(),
        }
    }
}

/// Substitute `{{name}}` placeholders in one left-to-right pass. Inserted
/// values are never scanned again.
pub fn render(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            rest = &rest[start..];
            break;
        };

        let name = &after[..end];
        match values.iter().find(|(key, _)| *key == name) {
            Some((_, value)) => out.push_str(value),
            None => {
                out.push_str("{{");
                out.push_str(name);
                out.push_str("}}");
            }
        }
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    out
}

impl Prompts {
    pub fn query_expansion(&self, clinical: &ClinicalInformation) -> String {
        let treatment = &clinical.treatment_request;
        render(
            &self.query_expansion_user,
            &[
                ("diagnosis", clinical.diagnosis.as_str()),
                (
                    "medication_or_procedure",
                    treatment.name_of_medication_or_procedure.as_str(),
                ),
                ("code", treatment.code_of_medication_or_procedure.as_str()),
                ("dosage", treatment.dosage.as_str()),
                ("duration", treatment.duration.as_str()),
                ("rationale", treatment.rationale.as_str()),
            ],
        )
    }

    pub fn summarize_policy(&self, policy_text: &str) -> String {
        render(&self.summarize_policy_user, &[("policy_text", policy_text)])
    }

    /// User prompt for the determination call. With `reasoning` the case
    /// details are wrapped in the self-contained reasoning template.
    pub fn prior_auth(
        &self,
        patient: &PatientInformation,
        physician: &PhysicianInformation,
        clinical: &ClinicalInformation,
        policy_text: &str,
        reasoning: bool,
    ) -> String {
        let contact = &physician.physician_contact;
        let treatment = &clinical.treatment_request;
        let details = render(
            &self.prior_auth_user,
            &[
                ("patient_name", patient.patient_name.as_str()),
                ("patient_dob", patient.patient_date_of_birth.as_str()),
                ("patient_id", patient.patient_id.as_str()),
                ("patient_address", patient.patient_address.as_str()),
                ("patient_phone", patient.patient_phone_number.as_str()),
                ("physician_name", physician.physician_name.as_str()),
                ("specialty", physician.specialty.as_str()),
                ("physician_phone", contact.office_phone.as_str()),
                ("physician_fax", contact.fax.as_str()),
                ("physician_address", contact.office_address.as_str()),
                ("diagnosis", clinical.diagnosis.as_str()),
                ("icd10_code", clinical.icd_10_code.as_str()),
                ("prior_treatments", clinical.prior_treatments_and_results.as_str()),
                ("specific_drugs", clinical.specific_drugs_taken_and_failures.as_str()),
                (
                    "alternative_drugs_required",
                    clinical.alternative_drugs_required.as_str(),
                ),
                ("lab_results", clinical.relevant_lab_results_or_imaging.as_str()),
                ("symptom_severity", clinical.symptom_severity_and_impact.as_str()),
                ("prognosis_risk", clinical.prognosis_and_risk_if_not_approved.as_str()),
                ("urgency_rationale", clinical.clinical_rationale_for_urgency.as_str()),
                (
                    "requested_medication",
                    treatment.name_of_medication_or_procedure.as_str(),
                ),
                ("medication_code", treatment.code_of_medication_or_procedure.as_str()),
                ("dosage", treatment.dosage.as_str()),
                ("treatment_duration", treatment.duration.as_str()),
                ("medication_rationale", treatment.rationale.as_str()),
                ("presumed_eligibility", treatment.presumed_eligibility.as_str()),
                ("policy_text", policy_text),
            ],
        );

        if reasoning {
            render(
                &self.prior_auth_reasoning_user,
                &[("case_details", details.as_str())],
            )
        } else {
            details
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_replaces_known_placeholders_only() {
        let out = render("{{a}} and {{b}} and {{c}}", &[("a", "1"), ("b", "2")]);
        assert_eq!(out, "1 and 2 and {{c}}");
    }

    #[test]
    fn inserted_values_are_not_expanded_again() {
        let out = render(
            "Diagnosis: {{diagnosis}}\nPolicy: {{policy_text}} {{",
            &[("diagnosis", "see {{policy_text}}"), ("policy_text", "P-1")],
        );
        assert_eq!(out, "Diagnosis: see {{policy_text}}\nPolicy: P-1 {{");
    }

    #[test]
    fn prior_auth_prompt_carries_policy_and_case() {
        let prompts = Prompts::default();
        let mut clinical = ClinicalInformation::default();
        clinical.diagnosis = "Severe persistent asthma".to_string();

        let prompt = prompts.prior_auth(
            &PatientInformation::default(),
            &PhysicianInformation::default(),
            &clinical,
            "Criterion 1: documented eosinophilia",
            false,
        );
        assert!(prompt.contains("Diagnosis: Severe persistent asthma"));
        assert!(prompt.contains("Criterion 1: documented eosinophilia"));
        assert!(!prompt.contains("{{"));

        let reasoning = prompts.prior_auth(
            &PatientInformation::default(),
            &PhysicianInformation::default(),
            &clinical,
            "policy",
            true,
        );
        assert!(reasoning.starts_with("You are a utilization management reviewer"));
        assert!(reasoning.contains("Diagnosis: Severe persistent asthma"));
    }
}
