pub mod assets;
pub mod config;
pub mod error;
pub mod markers;
pub mod pacing;
pub mod runner;
pub mod session;

pub use assets::{AssetPollConfig, AssetStore};
pub use config::{EngineConfig, DEFAULT_SYSTEM_INSTRUCTION};
pub use error::{AssetError, EngineError, TurnError};
pub use markers::{HardBlock, HardBlockMarkers};
pub use pacing::PacingPolicy;
pub use runner::{JobRunner, RunReport, RunState};
pub use session::{ConversationSession, TurnFragment};
