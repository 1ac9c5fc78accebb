/// A response that must end the run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HardBlock {
    ContentPolicy(String),
    Quota(String),
}

/// Substrings that mark a response body as a content-policy rejection or a
/// quota-window exhaustion. Matching is case-sensitive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HardBlockMarkers {
    pub content_policy: Vec<String>,
    pub quota: Vec<String>,
}

impl Default for HardBlockMarkers {
    fn default() -> Self {
        Self {
            content_policy: to_owned(&["PROHIBITED_CONTENT", "BlockedReason.", "blocked due to SAFETY"]),
            quota: to_owned(&[
                "GenerateRequestsPerDayPerProjectPerModel",
                "GenerateRequestsPerMinutePerProjectPerModel",
                "GenerateContentInputTokensPerModelPerMinute",
                "exceeded your current quota",
            ]),
        }
    }
}

impl HardBlockMarkers {
    pub fn none() -> Self {
        Self {
            content_policy: Vec::new(),
            quota: Vec::new(),
        }
    }

    /// First marker found in `text`, content policy checked first.
    pub fn detect(&self, text: &str) -> Option<HardBlock> {
        if let Some(m) = self.content_policy.iter().find(|m| text.contains(m.as_str())) {
            return Some(HardBlock::ContentPolicy(m.clone()));
        }
        self.quota
            .iter()
            .find(|m| text.contains(m.as_str()))
            .map(|m| HardBlock::Quota(m.clone()))
    }
}

fn to_owned(markers: &[&str]) -> Vec<String> {
    markers.iter().map(|m| m.to_string()).collect()
}
