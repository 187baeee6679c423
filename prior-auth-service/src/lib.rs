pub mod backends;
pub mod config;
pub mod models;
pub mod prompts;
pub mod schema;
pub mod service;
pub mod stages;
pub mod workflow;

pub use config::Settings;
pub use service::{AppState, build_router};
pub use workflow::{Backends, PaProcessor, build_pa_pipeline, open_repository};
pub use models::*;
