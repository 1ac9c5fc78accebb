use std::path::Path;

use serde::{Deserialize, Serialize};

/// Remote readiness of an uploaded asset. `Failed` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssetState {
    Pending,
    Active,
    Failed,
}

impl AssetState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Active | Self::Failed)
    }
}

/// Durable remote reference to a local file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetRef {
    /// Identity key, derived from the local file's basename.
    pub logical_name: String,
    pub remote_id: String,
    pub mime_type: String,
    pub uri: String,
    pub state: AssetState,
}

impl AssetRef {
    pub fn is_active(&self) -> bool {
        self.state == AssetState::Active
    }
}

/// Logical name used for dedup: the file's basename.
pub fn logical_name_for(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .map(str::to_owned)
}

/// MIME type inferred from the file extension.
pub fn mime_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("txt") => "text/plain",
        Some("md") => "text/markdown",
        Some("csv") => "text/csv",
        Some("html" | "htm") => "text/html",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logical_name_is_basename() {
        assert_eq!(
            logical_name_for(Path::new("/jobs/novel/UploadFiles/outline.txt")).as_deref(),
            Some("outline.txt")
        );
        assert_eq!(logical_name_for(Path::new("/")), None);
    }

    #[test]
    fn mime_types_by_extension() {
        assert_eq!(mime_type_for(Path::new("a.JPG")), "image/jpeg");
        assert_eq!(mime_type_for(Path::new("a.jpeg")), "image/jpeg");
        assert_eq!(mime_type_for(Path::new("a.webp")), "image/webp");
        assert_eq!(mime_type_for(Path::new("a.txt")), "text/plain");
        assert_eq!(mime_type_for(Path::new("noext")), "application/octet-stream");
    }

    #[test]
    fn terminal_states() {
        assert!(!AssetState::Pending.is_terminal());
        assert!(AssetState::Active.is_terminal());
        assert!(AssetState::Failed.is_terminal());
    }
}
