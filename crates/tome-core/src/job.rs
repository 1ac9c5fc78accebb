use serde::{Deserialize, Serialize};

use crate::ids::JobId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    File,
    Text,
}

/// One queued step of a job. `content` is a file path for `File` items and
/// the prompt text for `Text` items.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobItem {
    pub kind: ItemKind,
    pub content: String,
    #[serde(default = "default_send", alias = "sendFlag")]
    pub send: bool,
}

fn default_send() -> bool {
    true
}

impl JobItem {
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            kind: ItemKind::File,
            content: path.into(),
            send: true,
        }
    }

    pub fn text(prompt: impl Into<String>) -> Self {
        Self {
            kind: ItemKind::Text,
            content: prompt.into(),
            send: true,
        }
    }

    pub fn skipped(mut self) -> Self {
        self.send = false;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Absent until the job store assigns one.
    #[serde(default)]
    pub id: Option<JobId>,
    #[serde(default)]
    pub title: String,
    /// Working directory of the job, relative to the jobs root.
    pub dir: String,
    #[serde(default)]
    pub items: Vec<JobItem>,
}

impl Job {
    pub fn new(dir: impl Into<String>, items: Vec<JobItem>) -> Self {
        let dir = dir.into();
        Self {
            id: None,
            title: dir.clone(),
            dir,
            items,
        }
    }

    /// Index of the last text item that will actually be sent.
    pub fn last_sendable_text(&self) -> Option<usize> {
        last_sendable_text(&self.items)
    }
}

pub fn last_sendable_text(items: &[JobItem]) -> Option<usize> {
    items
        .iter()
        .rposition(|item| item.send && item.kind == ItemKind::Text)
}
