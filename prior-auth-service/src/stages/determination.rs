//! Final determination with a two-backend fallback policy.
//!
//! The stage is driven by [`State`]. [`transition`] holds every guard; the
//! stage only performs the call belonging to the current state and feeds the
//! [`Event`] back in:
//!
//! ```text
//! Start ──▶ PrimaryAttempt ──ctx-len──▶ SummarizedRetry(Primary) ─┐
//!   │            │ error                        │ ctx-len / error  │
//!   │            ▼                              ▼                  │
//!   └──────▶ SecondaryAttempt(n) ──ctx-len──▶ SummarizedRetry(Secondary(n))
//!                │ error, n < max                │ error, n < max
//!                ▼                               ▼
//!          SecondaryAttempt(n+1)          SecondaryAttempt(n+1)
//! ```
//!
//! Any completed call ends in `Done`; an error on the last secondary attempt
//! ends in `Failed`, which fails the run.

use async_trait::async_trait;
use pa_flow::{CaseStore, Context, FlowError, Result, Stage, StageResult};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::{
    backends::{
        BackendError, Completion, GenerationBackend, GenerationParams, GenerationRequest,
        SamplingParams, StageOutput,
    },
    config::DeterminationSettings,
    models::{ClinicalInformation, PatientInformation, PhysicianInformation},
    prompts::Prompts,
    stages::keys::{self, context_keys, result_keys, steps},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Primary,
    Secondary { attempt: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum State {
    Start,
    PrimaryAttempt,
    /// Same backend again, prompt rebuilt around the summarized policy
    SummarizedRetry(Backend),
    SecondaryAttempt(u32),
    Done(StageOutput),
    Failed(String),
}

/// What the call made in a state produced
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Begin { use_primary: bool },
    Completed(StageOutput),
    ContextLengthExceeded,
    Error(String),
}

/// Next state for `state` given `event`. Terminal states absorb every event.
pub fn transition(state: State, event: Event, max_retries: u32) -> State {
    let retry_or_fail = |attempt: u32, reason: String| {
        if attempt < max_retries {
            State::SecondaryAttempt(attempt + 1)
        } else {
            State::Failed(format!(
                "Determination failed after {} attempt(s) on the secondary backend: {}",
                attempt, reason
            ))
        }
    };

    match (state, event) {
        (State::Start, Event::Begin { use_primary: true }) => State::PrimaryAttempt,
        (State::Start, Event::Begin { use_primary: false }) => State::SecondaryAttempt(1),

        (State::Done(output), _) => State::Done(output),
        (State::Failed(reason), _) => State::Failed(reason),
        (_, Event::Completed(output)) => State::Done(output),

        (State::PrimaryAttempt, Event::ContextLengthExceeded) => {
            State::SummarizedRetry(Backend::Primary)
        }
        (State::PrimaryAttempt, _) => State::SecondaryAttempt(1),
        (State::SummarizedRetry(Backend::Primary), _) => State::SecondaryAttempt(1),

        (State::SecondaryAttempt(attempt), Event::ContextLengthExceeded) => {
            State::SummarizedRetry(Backend::Secondary { attempt })
        }
        (State::SecondaryAttempt(attempt), Event::Error(reason)) => retry_or_fail(attempt, reason),
        (State::SummarizedRetry(Backend::Secondary { attempt }), Event::Error(reason)) => {
            retry_or_fail(attempt, reason)
        }
        (State::SummarizedRetry(Backend::Secondary { attempt }), Event::ContextLengthExceeded) => {
            retry_or_fail(
                attempt,
                "prompt exceeds the context length even with a summarized policy".to_string(),
            )
        }

        (state, event) => {
            warn!(?state, ?event, "Unexpected determination event");
            state
        }
    }
}

/// Everything the prompt is built from, plus the summary once computed
struct CaseFacts {
    patient: PatientInformation,
    physician: PhysicianInformation,
    clinical: ClinicalInformation,
    policy_text: String,
    summary: Option<String>,
}

pub struct DeterminationStage {
    primary: Option<Arc<dyn GenerationBackend>>,
    secondary: Arc<dyn GenerationBackend>,
    prompts: Arc<Prompts>,
    settings: DeterminationSettings,
    summarization: SamplingParams,
}

impl DeterminationStage {
    pub fn new(
        primary: Option<Arc<dyn GenerationBackend>>,
        secondary: Arc<dyn GenerationBackend>,
        prompts: Arc<Prompts>,
        settings: DeterminationSettings,
        summarization: SamplingParams,
    ) -> Self {
        Self {
            primary,
            secondary,
            prompts,
            settings,
            summarization,
        }
    }

    /// Summarize the policy once per run; later calls reuse the result
    async fn summary(
        &self,
        case_id: &str,
        facts: &mut CaseFacts,
        store: &CaseStore,
    ) -> std::result::Result<String, BackendError> {
        if let Some(summary) = &facts.summary {
            return Ok(summary.clone());
        }

        info!(case_id = %case_id, "Summarizing policy text");
        let request = GenerationRequest::new(
            self.prompts.summarize_policy(&facts.policy_text),
            GenerationParams::text(self.summarization.clone()),
        )
        .with_system(&self.prompts.summarize_policy_system);

        let output = match self.secondary.complete(request).await? {
            Completion::Output(output) => output,
            Completion::ContextLengthExceeded => return Err(BackendError::ContextLengthExceeded),
        };

        let summary = output.text();
        store.log(
            keys::entry(result_keys::SUMMARY_POLICY, &summary),
            Some(output.conversation),
            steps::SUMMARIZE_POLICY,
        );
        facts.summary = Some(summary.clone());
        Ok(summary)
    }

    fn request(&self, backend: Backend, facts: &CaseFacts, policy_text: &str) -> GenerationRequest {
        match backend {
            Backend::Primary => GenerationRequest::new(
                self.prompts.prior_auth(
                    &facts.patient,
                    &facts.physician,
                    &facts.clinical,
                    policy_text,
                    true,
                ),
                GenerationParams::Reasoning {
                    max_completion_tokens: self.settings.reasoning_max_completion_tokens,
                },
            ),
            Backend::Secondary { .. } => GenerationRequest::new(
                self.prompts.prior_auth(
                    &facts.patient,
                    &facts.physician,
                    &facts.clinical,
                    policy_text,
                    false,
                ),
                GenerationParams::text(self.settings.sampling.clone()),
            )
            .with_system(&self.prompts.prior_auth_system),
        }
    }

    /// Make the call that belongs to `backend`, summarized or not
    async fn attempt(
        &self,
        case_id: &str,
        backend: Backend,
        summarized: bool,
        facts: &mut CaseFacts,
        store: &CaseStore,
    ) -> Event {
        let client = match (backend, &self.primary) {
            (Backend::Primary, Some(primary)) => primary.clone(),
            (Backend::Primary, None) => {
                return Event::Error("no reasoning backend configured".to_string());
            }
            (Backend::Secondary { .. }, _) => self.secondary.clone(),
        };

        let policy_text = if summarized {
            match self.summary(case_id, facts, store).await {
                Ok(summary) => summary,
                Err(e) => {
                    error!(case_id = %case_id, error = %e, "Policy summarization failed");
                    return Event::Error(format!("policy summarization failed: {}", e));
                }
            }
        } else {
            facts.policy_text.clone()
        };

        info!(
            case_id = %case_id,
            client = %client.name(),
            ?backend,
            summarized,
            "Requesting final determination"
        );

        match client.complete(self.request(backend, facts, &policy_text)).await {
            Ok(Completion::Output(output)) => Event::Completed(output),
            Ok(Completion::ContextLengthExceeded) => {
                warn!(case_id = %case_id, backend = %client.name(), summarized, "Determination prompt exceeds context length");
                Event::ContextLengthExceeded
            }
            Err(e) => {
                error!(case_id = %case_id, backend = %client.name(), error = %e, "Determination call failed");
                Event::Error(e.to_string())
            }
        }
    }

    async fn determine(
        &self,
        case_id: &str,
        use_primary: bool,
        facts: &mut CaseFacts,
        store: &CaseStore,
    ) -> Result<StageOutput> {
        let max_retries = self.settings.max_retries.max(1);
        let mut state = transition(State::Start, Event::Begin { use_primary }, max_retries);

        loop {
            let event = match &state {
                State::Done(_) | State::Failed(_) | State::Start => break,
                State::PrimaryAttempt => {
                    self.attempt(case_id, Backend::Primary, false, facts, store).await
                }
                State::SecondaryAttempt(attempt) => {
                    let backend = Backend::Secondary { attempt: *attempt };
                    self.attempt(case_id, backend, false, facts, store).await
                }
                State::SummarizedRetry(backend) => {
                    self.attempt(case_id, *backend, true, facts, store).await
                }
            };
            state = transition(state, event, max_retries);
        }

        match state {
            State::Done(output) => Ok(output),
            State::Failed(reason) => Err(FlowError::StageFailed(reason)),
            other => Err(FlowError::StageFailed(format!(
                "Determination stopped in state {:?}",
                other
            ))),
        }
    }
}

#[async_trait]
impl Stage for DeterminationStage {
    fn id(&self) -> &str {
        "llm_determination"
    }

    async fn run(&self, context: &Context, store: &CaseStore) -> Result<StageResult> {
        let case_id = context.case_id();
        let mut facts = CaseFacts {
            patient: context.require(context_keys::PATIENT_INFO).await?,
            physician: context.require(context_keys::PHYSICIAN_INFO).await?,
            clinical: context.require(context_keys::CLINICAL_INFO).await?,
            policy_text: context.require(context_keys::POLICY_TEXT).await?,
            summary: None,
        };

        let wants_reasoning = context
            .get::<bool>(context_keys::USE_REASONING)
            .await
            .unwrap_or(self.settings.use_reasoning_backend);
        let use_primary = wants_reasoning && self.primary.is_some();
        if wants_reasoning && !use_primary {
            warn!(case_id = %case_id, "No reasoning backend configured, using the secondary backend");
        }

        let output = self.determine(case_id, use_primary, &mut facts, store).await?;
        let determination = output.text();

        store.log(
            keys::entry(result_keys::FINAL_DETERMINATION, &determination),
            Some(output.conversation),
            steps::LLM_DETERMINATION,
        );
        context
            .set(context_keys::FINAL_DETERMINATION, &determination)
            .await?;

        info!(case_id = %case_id, "Final determination generated");
        Ok(StageResult::proceed("Final determination generated"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::fakes::{FakeGeneration, context_length, failure, text};
    use pa_flow::InMemoryCaseRepository;

    async fn setup() -> (Context, CaseStore) {
        let context = Context::new("case-d");
        context
            .set(context_keys::PATIENT_INFO, PatientInformation::default())
            .await
            .unwrap();
        context
            .set(context_keys::PHYSICIAN_INFO, PhysicianInformation::default())
            .await
            .unwrap();
        context
            .set(context_keys::CLINICAL_INFO, ClinicalInformation::default())
            .await
            .unwrap();
        context
            .set(context_keys::POLICY_TEXT, "FULL POLICY TEXT")
            .await
            .unwrap();
        let store = CaseStore::new("case-d", Arc::new(InMemoryCaseRepository::new()));
        (context, store)
    }

    fn stage(
        primary: Option<Arc<FakeGeneration>>,
        secondary: Arc<FakeGeneration>,
    ) -> DeterminationStage {
        DeterminationStage::new(
            primary.map(|p| p as Arc<dyn GenerationBackend>),
            secondary,
            Arc::new(Prompts::default()),
            DeterminationSettings::default(),
            SamplingParams::default().with_max_tokens(4096),
        )
    }

    fn output(response: &str) -> StageOutput {
        StageOutput {
            response: serde_json::Value::String(response.to_string()),
            conversation: Vec::new(),
        }
    }

    #[test]
    fn transitions_follow_the_fallback_policy() {
        let s = transition(State::Start, Event::Begin { use_primary: true }, 2);
        assert_eq!(s, State::PrimaryAttempt);

        let s = transition(s, Event::ContextLengthExceeded, 2);
        assert_eq!(s, State::SummarizedRetry(Backend::Primary));

        let s = transition(s, Event::ContextLengthExceeded, 2);
        assert_eq!(s, State::SecondaryAttempt(1));

        let s = transition(s, Event::Error("boom".into()), 2);
        assert_eq!(s, State::SecondaryAttempt(2));

        let s = transition(s, Event::ContextLengthExceeded, 2);
        assert_eq!(s, State::SummarizedRetry(Backend::Secondary { attempt: 2 }));

        let s = transition(s, Event::Error("boom".into()), 2);
        assert!(matches!(s, State::Failed(reason) if reason.contains("boom")));
    }

    #[test]
    fn primary_error_falls_back_and_terminal_states_absorb() {
        assert_eq!(
            transition(State::PrimaryAttempt, Event::Error("down".into()), 2),
            State::SecondaryAttempt(1)
        );
        assert_eq!(
            transition(State::Start, Event::Begin { use_primary: false }, 2),
            State::SecondaryAttempt(1)
        );

        let done = State::Done(output("APPROVED"));
        assert_eq!(transition(done.clone(), Event::Error("late".into()), 2), done);
        assert_eq!(
            transition(State::SecondaryAttempt(2), Event::Completed(output("DENIED")), 2),
            State::Done(output("DENIED"))
        );
    }

    #[tokio::test]
    async fn primary_context_length_gets_exactly_one_summarized_retry() {
        let primary = FakeGeneration::scripted("o1", vec![context_length(), context_length()]);
        let secondary = FakeGeneration::scripted(
            "gpt-4o",
            vec![text("SHORT SUMMARY"), text("APPROVED")],
        );
        let (context, store) = setup().await;

        stage(Some(primary.clone()), secondary.clone())
            .run(&context, &store)
            .await
            .unwrap();

        assert_eq!(primary.calls(), 2);
        let primary_requests = primary.requests();
        assert!(primary_requests[0].query.contains("FULL POLICY TEXT"));
        assert!(primary_requests[1].query.contains("SHORT SUMMARY"));
        assert!(primary_requests[1].system_message.is_none());

        // one summarization call, then one determination attempt
        assert_eq!(secondary.calls(), 2);

        let results = store.results();
        assert_eq!(results["summary_policy"], "SHORT SUMMARY");
        assert_eq!(results["final_determination"], "APPROVED");
    }

    #[tokio::test]
    async fn two_secondary_failures_raise() {
        let secondary = FakeGeneration::scripted(
            "gpt-4o",
            vec![failure("first"), failure("second"), text("never used")],
        );
        let (context, store) = setup().await;

        let result = stage(None, secondary.clone()).run(&context, &store).await;

        assert!(matches!(result, Err(FlowError::StageFailed(msg)) if msg.contains("second")));
        assert_eq!(secondary.calls(), 2);
        assert!(!store.results().contains_key("final_determination"));
    }

    #[tokio::test]
    async fn primary_error_falls_back_to_secondary() {
        let primary = FakeGeneration::scripted("o1", vec![failure("reasoning outage")]);
        let secondary = FakeGeneration::scripted("gpt-4o", vec![text("DENIED")]);
        let (context, store) = setup().await;

        stage(Some(primary.clone()), secondary.clone())
            .run(&context, &store)
            .await
            .unwrap();

        assert_eq!(primary.calls(), 1);
        let request = &secondary.requests()[0];
        assert!(request.system_message.is_some());
        assert_eq!(
            request.params.response_format(),
            crate::backends::ResponseFormat::Text
        );
        assert_eq!(store.results()["final_determination"], "DENIED");
    }

    #[tokio::test]
    async fn secondary_context_length_retries_within_the_same_attempt() {
        let secondary = FakeGeneration::scripted(
            "gpt-4o",
            vec![context_length(), text("SUMMARY"), text("APPROVED")],
        );
        let (context, store) = setup().await;
        context.set(context_keys::USE_REASONING, false).await.unwrap();

        let primary = FakeGeneration::scripted("o1", vec![]);
        stage(Some(primary.clone()), secondary.clone())
            .run(&context, &store)
            .await
            .unwrap();

        assert_eq!(primary.calls(), 0);
        assert_eq!(secondary.calls(), 3);
        assert!(secondary.requests()[2].query.contains("SUMMARY"));
        let determination: String = context
            .require(context_keys::FINAL_DETERMINATION)
            .await
            .unwrap();
        assert_eq!(determination, "APPROVED");
    }
}
