use std::sync::{PoisonError, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{config::TrackerConfig, storage::entities::ActivitySpan};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub category: String,
    pub work_item_id: Option<String>,
    pub confidence: f32,
}

/// Assigns meaning to a sealed span. Implementations may be slow or remote; the engine calls them
/// off its own task and bounds every call with a timeout.
#[async_trait]
pub trait Classifier: Send + Sync + 'static {
    /// `Ok(None)` means the classifier has no opinion about the span.
    async fn classify(&self, span: &ActivitySpan) -> Result<Option<Classification>>;

    /// Called when the daemon configuration was reloaded.
    fn reconfigure(&self, _config: &TrackerConfig) {}
}

/// A configured `pattern -> category` mapping, optionally attributing matches to a work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassificationRule {
    pub pattern: String,
    pub category: String,
    #[serde(default)]
    pub work_item_id: Option<String>,
}

/// Default classifier. Rules are checked in order, each one against the window title first and
/// the application name second.
pub struct RuleClassifier {
    rules: RwLock<Vec<ClassificationRule>>,
}

fn normalize(rules: Vec<ClassificationRule>) -> Vec<ClassificationRule> {
    rules
        .into_iter()
        .map(|v| ClassificationRule {
            pattern: v.pattern.to_lowercase(),
            ..v
        })
        .filter(|v| !v.pattern.is_empty())
        .collect()
}

impl RuleClassifier {
    pub fn new(rules: Vec<ClassificationRule>) -> Self {
        Self {
            rules: RwLock::new(normalize(rules)),
        }
    }

    fn find(rules: &[ClassificationRule], haystack: &str) -> Option<ClassificationRule> {
        let haystack = haystack.to_lowercase();
        rules.iter().find(|v| haystack.contains(&v.pattern)).cloned()
    }
}

#[async_trait]
impl Classifier for RuleClassifier {
    async fn classify(&self, span: &ActivitySpan) -> Result<Option<Classification>> {
        let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner);
        let by_title = Self::find(&rules, &span.window_title).map(|v| (v, 0.9));
        let matched = by_title.or_else(|| Self::find(&rules, &span.app_name).map(|v| (v, 0.7)));

        Ok(matched.map(|(rule, confidence)| Classification {
            category: rule.category,
            work_item_id: rule.work_item_id,
            confidence,
        }))
    }

    fn reconfigure(&self, config: &TrackerConfig) {
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        *rules = normalize(config.rules.clone());
    }
}
