use async_trait::async_trait;
use pa_flow::{CaseStore, Context, Result, Stage, StageResult};
use std::sync::Arc;
use tracing::{error, info};

use crate::{
    backends::{Completion, GenerationBackend, GenerationParams, GenerationRequest, SamplingParams},
    models::{ClinicalInformation, PageImage, PatientInformation, PhysicianInformation},
    prompts::Prompts,
    schema::{Schema, SchemaError, validate},
    stages::keys::{self, context_keys, result_keys, steps},
};

/// Sampling settings for each of the three extraction calls
#[derive(Debug, Clone, Default)]
pub struct ExtractionSettings {
    pub patient: SamplingParams,
    pub physician: SamplingParams,
    pub clinical: SamplingParams,
}

/// What one extraction call asks for and where its result goes
struct Target<'a> {
    result_key: &'static str,
    step: &'static str,
    system_prompt: &'a str,
    user_prompt: &'a str,
    sampling: &'a SamplingParams,
}

/// Reads patient, physician and clinical records off the page images.
///
/// The three calls run concurrently against the same images. A call that
/// fails leaves its record at the all-default value; the others are kept.
pub struct ExtractionStage {
    generation: Arc<dyn GenerationBackend>,
    prompts: Arc<Prompts>,
    settings: ExtractionSettings,
}

impl ExtractionStage {
    pub fn new(
        generation: Arc<dyn GenerationBackend>,
        prompts: Arc<Prompts>,
        settings: ExtractionSettings,
    ) -> Self {
        Self {
            generation,
            prompts,
            settings,
        }
    }

    async fn extract<T: Schema>(
        &self,
        case_id: &str,
        target: Target<'_>,
        images: &[PageImage],
        store: &CaseStore,
    ) -> std::result::Result<T, SchemaError> {
        info!(case_id = %case_id, step = target.step, "Extracting {}", T::NAME);

        let request = GenerationRequest::new(
            target.user_prompt,
            GenerationParams::json(target.sampling.clone()),
        )
        .with_system(target.system_prompt)
        .with_images(images.to_vec());

        let output = match self.generation.complete(request).await {
            Ok(Completion::Output(output)) => output,
            Ok(Completion::ContextLengthExceeded) => {
                error!(case_id = %case_id, step = target.step, "Page images exceed the model context length");
                return Ok(T::default());
            }
            Err(e) => {
                error!(case_id = %case_id, step = target.step, error = %e, "Extraction call failed");
                return Ok(T::default());
            }
        };

        let record: T = validate(&output.response)?;

        store.log(
            keys::entry(target.result_key, &record),
            Some(output.conversation),
            target.step,
        );

        Ok(record)
    }
}

#[async_trait]
impl Stage for ExtractionStage {
    fn id(&self) -> &str {
        "clinical_extraction"
    }

    async fn run(&self, context: &Context, store: &CaseStore) -> Result<StageResult> {
        let case_id = context.case_id();
        let images: Vec<PageImage> = context.require(context_keys::PAGE_IMAGES).await?;
        info!(case_id = %case_id, pages = images.len(), "Starting clinical data extraction");

        let prompts = &self.prompts;
        let (patient, physician, clinical) = tokio::try_join!(
            self.extract::<PatientInformation>(
                case_id,
                Target {
                    result_key: result_keys::PATIENT_INFO,
                    step: steps::PATIENT_EXTRACTION,
                    system_prompt: &prompts.patient_system,
                    user_prompt: &prompts.patient_user,
                    sampling: &self.settings.patient,
                },
                &images,
                store,
            ),
            self.extract::<PhysicianInformation>(
                case_id,
                Target {
                    result_key: result_keys::PHYSICIAN_INFO,
                    step: steps::PHYSICIAN_EXTRACTION,
                    system_prompt: &prompts.physician_system,
                    user_prompt: &prompts.physician_user,
                    sampling: &self.settings.physician,
                },
                &images,
                store,
            ),
            self.extract::<ClinicalInformation>(
                case_id,
                Target {
                    result_key: result_keys::CLINICAL_INFO,
                    step: steps::CLINICAL_EXTRACTION,
                    system_prompt: &prompts.clinical_system,
                    user_prompt: &prompts.clinical_user,
                    sampling: &self.settings.clinical,
                },
                &images,
                store,
            ),
        )?;

        context.set(context_keys::PATIENT_INFO, &patient).await?;
        context.set(context_keys::PHYSICIAN_INFO, &physician).await?;
        context.set(context_keys::CLINICAL_INFO, &clinical).await?;

        info!(case_id = %case_id, "Clinical data extraction completed");
        Ok(StageResult::proceed("Patient, physician and clinical data extracted"))
    }
}
