use serde::{Deserialize, Serialize};

use crate::asset::AssetRef;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

/// One element of a turn. Provider payloads may carry part kinds this crate
/// does not model; those land in `Unknown` and are dropped when history is
/// written out.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Part {
    Text {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    FileRef {
        mime_type: String,
        uri: String,
    },
    Unknown {
        kind: String,
        #[serde(default)]
        raw: serde_json::Value,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn file_ref(asset: &AssetRef) -> Self {
        Self::FileRef {
            mime_type: asset.mime_type.clone(),
            uri: asset.uri.clone(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// One exchange unit in a conversation. Never mutated after it is appended
/// to a session's history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Turn {
    /// Build a user turn: the prompt text (if any) followed by one file
    /// reference per asset.
    pub fn user(text: &str, assets: &[AssetRef]) -> Self {
        let mut parts = Vec::with_capacity(assets.len() + 1);
        if !text.is_empty() {
            parts.push(Part::text(text));
        }
        parts.extend(assets.iter().map(Part::file_ref));
        Self {
            role: Role::User,
            parts,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            parts: vec![Part::text(text)],
        }
    }

    /// Concatenated text of all text parts.
    pub fn text(&self) -> String {
        self.parts.iter().filter_map(Part::as_text).collect()
    }

    pub fn file_refs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.parts.iter().filter_map(|p| match p {
            Part::FileRef { mime_type, uri } => Some((mime_type.as_str(), uri.as_str())),
            _ => None,
        })
    }
}
