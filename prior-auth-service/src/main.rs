use prior_auth_service::{AppState, Backends, PaProcessor, Settings, build_router, open_repository};
use tokio::net::TcpListener;
use tracing::{Level, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env().add_directive(Level::INFO.into());
    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    let settings = Settings::load()?;
    let backends = Backends::from_settings(&settings)?;
    let repository = open_repository(&settings).await?;
    let processor = PaProcessor::new(&backends, &settings, repository);

    let app = build_router(AppState { processor });
    let listener = TcpListener::bind(format!("0.0.0.0:{}", settings.server.port)).await?;
    let addr = listener.local_addr()?;

    info!("Prior Authorization Service starting on {}", addr);
    info!("Health check endpoint: http://{}/health", addr);
    info!("Processing endpoint: POST http://{}/pa/process", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
