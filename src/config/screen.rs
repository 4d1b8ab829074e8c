use serde::{Deserialize, Serialize};

/// Pre-screener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScreenConfig {
    /// Abusive-token lexicon. Matched case-insensitively on word
    /// boundaries. The default list is intentionally small; deployments
    /// extend it per audience.
    #[serde(default = "default_abuse_lexicon")]
    pub abuse_lexicon: Vec<String>,
}

impl Default for ScreenConfig {
    fn default() -> Self {
        Self {
            abuse_lexicon: default_abuse_lexicon(),
        }
    }
}

fn default_abuse_lexicon() -> Vec<String> {
    [
        "idiot", "stupid", "moron", "dumbass", "jerk", "loser", "trash", "scum",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
