//! Response selector: first keyword group found in the text picks the canned reply.

use crate::config::{RepliesConfig, ReplyRule};

#[derive(Debug, Clone)]
pub struct ReplySelector {
    rules: Vec<ReplyRule>,
    fallback: String,
}

impl ReplySelector {
    /// Build from config; keywords are lowercased once here and blank ones dropped.
    pub fn new(config: &RepliesConfig) -> Self {
        let rules = config
            .rules
            .iter()
            .map(|r| ReplyRule {
                keywords: r
                    .keywords
                    .iter()
                    .map(|k| k.trim().to_lowercase())
                    .filter(|k| !k.is_empty())
                    .collect(),
                reply: r.reply.clone(),
            })
            .filter(|r| !r.keywords.is_empty())
            .collect();
        Self {
            rules,
            fallback: config.fallback.clone(),
        }
    }

    pub fn select(&self, text: &str) -> &str {
        let text = text.to_lowercase();
        self.rules
            .iter()
            .find(|r| r.keywords.iter().any(|k| text.contains(k.as_str())))
            .map(|r| r.reply.as_str())
            .unwrap_or(&self.fallback)
    }
}

impl Default for ReplySelector {
    fn default() -> Self {
        Self::new(&RepliesConfig::default())
    }
}
