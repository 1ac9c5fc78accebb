pub mod event_bridge;
pub mod handlers;
pub mod orchestrator;
pub mod server;

pub use event_bridge::EventHub;
pub use handlers::{ApiError, HandlerState};
pub use orchestrator::{EngineOrchestrator, RunOrchestrator};
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
