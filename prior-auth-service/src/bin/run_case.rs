use anyhow::{Result, bail};
use pa_flow::RunOutcome;
use prior_auth_service::{Backends, PaProcessor, Settings, open_repository};
use tracing::{Level, error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Process local PDFs as one prior authorization case and print the stored
/// case document.
#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let files: Vec<String> = std::env::args().skip(1).collect();
    if files.is_empty() {
        bail!("usage: run_case <pdf>...");
    }
    for file in &files {
        if !std::path::Path::new(file).is_file() {
            bail!("not a file: {}", file);
        }
    }

    let settings = Settings::load()?;
    let backends = Backends::from_settings(&settings)?;
    let repository = open_repository(&settings).await?;
    let processor = PaProcessor::new(&backends, &settings, repository.clone());

    let report = processor.process_documents(None, files, None).await?;
    match &report.outcome {
        RunOutcome::Completed => info!(case_id = %report.case_id, "Case completed"),
        RunOutcome::Stopped { reason, .. } => {
            info!(case_id = %report.case_id, reason = %reason, "Case stopped")
        }
        RunOutcome::Failed { error, .. } => {
            error!(case_id = %report.case_id, error = %error, "Case failed")
        }
    }

    let document = match repository.get(&report.case_id).await? {
        Some(document) => document,
        None => serde_json::Value::Object(report.results),
    };
    println!("{}", serde_json::to_string_pretty(&document)?);

    Ok(())
}
