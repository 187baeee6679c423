/// Keys for values handed between stages through the run context
pub mod context_keys {
    pub const UPLOADED_FILES: &str = "uploaded_files";
    pub const PAGE_IMAGES: &str = "page_images";
    pub const USE_REASONING: &str = "use_reasoning";
    pub const PATIENT_INFO: &str = "patient_info";
    pub const PHYSICIAN_INFO: &str = "physician_info";
    pub const CLINICAL_INFO: &str = "clinical_info";
    pub const OPTIMIZED_QUERY: &str = "optimized_query";
    pub const POLICY_LOCATION: &str = "policy_location";
    pub const POLICY_TEXT: &str = "policy_text";
    pub const FINAL_DETERMINATION: &str = "final_determination";
}

/// Keys of the persisted case document
pub mod result_keys {
    pub const RAW_UPLOADED_FILES: &str = "raw_uploaded_files";
    pub const PROCESSED_IMAGES: &str = "processed_images";
    pub const PATIENT_INFO: &str = "patient_info";
    pub const PHYSICIAN_INFO: &str = "physician_info";
    pub const CLINICAL_INFO: &str = "clinical_info";
    pub const OPTIMIZED_QUERY: &str = "optimized_query";
    pub const POLICY_LOCATION: &str = "policy_location";
    pub const POLICY_TEXT: &str = "policy_text";
    pub const SUMMARY_POLICY: &str = "summary_policy";
    pub const FINAL_DETERMINATION: &str = "final_determination";
}

/// Step names recorded with each logged entry
pub mod steps {
    pub const INGEST: &str = "ingest";
    pub const PATIENT_EXTRACTION: &str = "patient_extraction";
    pub const PHYSICIAN_EXTRACTION: &str = "physician_extraction";
    pub const CLINICAL_EXTRACTION: &str = "clinical_extraction";
    pub const QUERY_EXPANSION: &str = "query_expansion";
    pub const POLICY_SEARCH: &str = "policy_search";
    pub const POLICY_EXTRACTION: &str = "policy_extraction";
    pub const SUMMARIZE_POLICY: &str = "summarize_policy";
    pub const LLM_DETERMINATION: &str = "llm_determination";
}

/// One-entry mapping for [`pa_flow::CaseStore::log`]
pub fn entry(key: &str, value: impl serde::Serialize) -> serde_json::Value {
    let mut data = serde_json::Map::new();
    data.insert(
        key.to_string(),
        serde_json::to_value(value).unwrap_or(serde_json::Value::Null),
    );
    serde_json::Value::Object(data)
}
