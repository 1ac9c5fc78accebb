use serde::{Deserialize, Serialize};

use crate::messages::Turn;

/// Sampling options sent with every generation request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    pub temperature: Option<f64>,
    pub max_output_tokens: Option<u32>,
}

/// The complete request handed to a provider: persona, ordered history
/// (ending with the pending user turn) and sampling options.
#[derive(Clone, Debug)]
pub struct GenerationContext {
    pub system_instruction: String,
    pub turns: Vec<Turn>,
    pub options: GenerationOptions,
}

impl GenerationContext {
    /// Create an empty context (useful for testing).
    pub fn empty() -> Self {
        Self {
            system_instruction: String::new(),
            turns: Vec::new(),
            options: GenerationOptions::default(),
        }
    }

    /// The turn awaiting a response.
    pub fn pending_turn(&self) -> Option<&Turn> {
        self.turns.last()
    }
}
