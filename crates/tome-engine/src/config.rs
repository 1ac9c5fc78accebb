use tome_core::context::GenerationOptions;
use tome_llm::RetryPolicy;

use crate::assets::AssetPollConfig;
use crate::markers::HardBlockMarkers;
use crate::pacing::PacingPolicy;

/// Fiction-writing persona used when a job does not supply its own.
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "\
小說寫作原則：
在確保品質的前提下盡量寫長、寫細，避免重複與空洞的內容。
以人物對話推動情節，描寫聲音、動作與心理變化，語言直白易懂，前後對話要連貫。
角色發生衝突或情緒起伏時，要交代內心的拉扯與反應過程。
場景描寫要有足夠細節，讓讀者身歷其境；情節須合乎邏輯。
輸出連續的文章，可以分段，但不要條列，也不要自行分章節。";

/// Everything a run needs besides its collaborators.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub system_instruction: String,
    pub options: GenerationOptions,
    pub retry: RetryPolicy,
    pub pacing: PacingPolicy,
    pub asset_poll: AssetPollConfig,
    pub markers: HardBlockMarkers,
    /// Consume responses incrementally and emit a `data` event per fragment.
    pub streaming: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            options: GenerationOptions {
                temperature: Some(1.0),
                max_output_tokens: None,
            },
            retry: RetryPolicy::default(),
            pacing: PacingPolicy::default(),
            asset_poll: AssetPollConfig::default(),
            markers: HardBlockMarkers::default(),
            streaming: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.asset_poll.interval, Duration::from_secs(5));
        assert_eq!(config.asset_poll.max_wait, Duration::from_secs(600));
        assert!(config.streaming);
        assert!(!config.system_instruction.is_empty());
    }
}
