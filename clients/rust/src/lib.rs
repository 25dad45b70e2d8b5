//! Feature flag evaluation with targeting rules and percentage rollout.
//!
//! A [`FlagEvaluator`] owns a registry of [`Flag`]s keyed by name and answers
//! two questions for a caller-supplied [`Context`]: is the flag on, and which
//! variant applies. Evaluation is deterministic and fails closed: unknown
//! flags, unknown operators and malformed rules all resolve to "disabled".

pub mod bucket;
pub mod features;
pub mod testing;

pub use bucket::Bucketing;
pub use features::{
    Context, ContextValue, EvaluationDetail, Flag, Operator, Reason, Rule, RuleValue,
};

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use toggles_validation::{
    FlagDocuments, ValidationError, load_flags_dir, load_flags_file, resolve_flags_dir,
};
use tracing::{debug, trace};

#[derive(Debug, Error)]
pub enum FlagsError {
    #[error("Flag source error: {0}")]
    Source(#[from] ValidationError),

    #[error("Invalid definition for flag '{key}': {source}")]
    InvalidFlag {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, FlagsError>;

/// Settings shared by every evaluation of one [`FlagEvaluator`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EvaluatorConfig {
    /// Context attribute holding the user identifier used for rollout.
    pub user_id_attribute: String,
    /// Variant returned for an enabled flag when no rule matches.
    pub control_variant: String,
    pub bucketing: Bucketing,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            user_id_attribute: "userId".to_string(),
            control_variant: "control".to_string(),
            bucketing: Bucketing::default(),
        }
    }
}

type Registry = HashMap<String, Arc<Flag>>;

/// In-memory flag registry and evaluator.
///
/// Reads never block: every evaluation works on an immutable snapshot of the
/// registry, and writers publish a new snapshot. Changes are visible to the
/// next call.
pub struct FlagEvaluator {
    config: EvaluatorConfig,
    flags: ArcSwap<Registry>,
}

impl FlagEvaluator {
    /// Create an empty evaluator with the default configuration.
    pub fn new() -> Self {
        Self::with_config(EvaluatorConfig::default())
    }

    pub fn with_config(config: EvaluatorConfig) -> Self {
        Self {
            config,
            flags: ArcSwap::from_pointee(Registry::new()),
        }
    }

    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    /// Load flags using fallback chain: `TOGGLES_DIR` env var, then `/etc/toggles`
    /// if it exists, otherwise `toggles/`.
    pub fn from_env() -> Result<Self> {
        Self::from_directory(&resolve_flags_dir())
    }

    /// Load every `*.json` flag file in `dir` (useful for testing).
    pub fn from_directory(dir: &Path) -> Result<Self> {
        let evaluator = Self::new();
        evaluator.reload_from(dir)?;
        Ok(evaluator)
    }

    /// Replace the whole registry with the flags found in `dir`.
    ///
    /// The registry is left untouched if any file fails to load.
    /// Returns the number of flags loaded.
    pub fn reload_from(&self, dir: &Path) -> Result<usize> {
        let registry = build_registry(load_flags_dir(dir)?)?;
        let count = registry.len();
        self.flags.store(Arc::new(registry));
        debug!(dir = %dir.display(), count, "loaded flags");
        Ok(count)
    }

    /// Load a single flag file, such as one written by `toggles build`.
    pub fn from_file(path: &Path) -> Result<Self> {
        let registry = build_registry(load_flags_file(path)?)?;
        debug!(file = %path.display(), count = registry.len(), "loaded flags");
        Ok(Self {
            config: EvaluatorConfig::default(),
            flags: ArcSwap::from_pointee(registry),
        })
    }

    /// Insert or replace the flag at `key`. No validation is performed.
    pub fn set_flag(&self, key: impl Into<String>, flag: Flag) {
        let key = key.into();
        let flag = Arc::new(flag);
        self.flags.rcu(|current| {
            let mut next = Registry::clone(current);
            next.insert(key.clone(), Arc::clone(&flag));
            next
        });
    }

    /// Insert or replace several flags in one update.
    pub fn set_flags<I, K>(&self, flags: I)
    where
        I: IntoIterator<Item = (K, Flag)>,
        K: Into<String>,
    {
        let batch: Vec<(String, Arc<Flag>)> = flags
            .into_iter()
            .map(|(k, f)| (k.into(), Arc::new(f)))
            .collect();
        self.flags.rcu(|current| {
            let mut next = Registry::clone(current);
            next.extend(batch.iter().cloned());
            next
        });
    }

    /// Remove the flag at `key`, returning its previous definition.
    pub fn remove_flag(&self, key: &str) -> Option<Flag> {
        let mut removed = None;
        self.flags.rcu(|current| {
            let mut next = Registry::clone(current);
            removed = next.remove(key);
            next
        });
        removed.map(Arc::unwrap_or_clone)
    }

    /// Empty the registry. Idempotent.
    pub fn reset(&self) {
        self.flags.store(Arc::new(Registry::new()));
    }

    pub fn get_flag(&self, key: &str) -> Option<Flag> {
        self.flags.load().get(key).map(|flag| Flag::clone(flag))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.flags.load().contains_key(key)
    }

    /// Registered keys in sorted order.
    pub fn flag_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.flags.load().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.flags.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.load().is_empty()
    }

    /// Whether `key` is on for `context`. Unknown flags are off.
    pub fn is_enabled(&self, key: &str, context: Option<&Context>) -> bool {
        self.is_enabled_detail(key, context).enabled
    }

    /// Same decision as [`FlagEvaluator::is_enabled`], with the reason for it.
    ///
    /// Decision order: first matching targeting rule (`"on"` enables, any
    /// other variation disables), then rollout bucketing when the context
    /// carries a user identifier, then the flag's `enabled` default.
    pub fn is_enabled_detail(&self, key: &str, context: Option<&Context>) -> EvaluationDetail {
        let snapshot = self.flags.load();
        let Some(flag) = snapshot.get(key) else {
            trace!(flag = key, "flag not found");
            return EvaluationDetail::not_found();
        };

        let detail = features::evaluate_enabled(key, flag, context, &self.config);
        match &detail.reason {
            Reason::RuleMatch { index, variation } => {
                debug!(flag = key, rule = index, variation = %variation, enabled = detail.enabled, "targeting rule matched");
            }
            Reason::Rollout { bucket, percentage } => {
                debug!(flag = key, bucket, percentage, enabled = detail.enabled, "rollout decided");
            }
            Reason::Fallthrough | Reason::FlagNotFound => {
                trace!(flag = key, enabled = detail.enabled, "no rule matched");
            }
        }
        detail
    }

    /// Variant name for `key`, or `None` when the flag is unknown, declares
    /// no variants, or is disabled with no matching rule.
    pub fn get_variant(&self, key: &str, context: Option<&Context>) -> Option<String> {
        let snapshot = self.flags.load();
        let flag = snapshot.get(key)?;
        let variant = features::resolve_variant(flag, context, &self.config);
        trace!(flag = key, variant = ?variant, "resolved variant");
        variant
    }

    /// Payload of the variant [`FlagEvaluator::get_variant`] resolves to, when
    /// that name is declared in the flag's `variants`.
    pub fn variant_payload(&self, key: &str, context: Option<&Context>) -> Option<Value> {
        let snapshot = self.flags.load();
        let flag = snapshot.get(key)?;
        let name = features::resolve_variant(flag, context, &self.config)?;
        flag.variants.as_ref()?.get(&name).cloned()
    }
}

impl Default for FlagEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

fn build_registry(documents: FlagDocuments) -> Result<Registry> {
    documents
        .into_iter()
        .map(|(key, definition)| {
            let flag = parse_flag(&key, definition)?;
            Ok((key, Arc::new(flag)))
        })
        .collect()
}

fn parse_flag(key: &str, definition: Value) -> Result<Flag> {
    serde_json::from_value(definition).map_err(|source| FlagsError::InvalidFlag {
        key: key.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn create_flags_file(dir: &Path, name: &str, contents: &str) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(name), contents).unwrap();
    }

    #[test]
    fn test_unknown_flag_is_disabled() {
        let evaluator = FlagEvaluator::new();
        assert!(!evaluator.is_enabled("non-existent-flag", None));
        assert_eq!(evaluator.get_variant("non-existent-flag", None), None);
        assert_eq!(
            evaluator.is_enabled_detail("non-existent-flag", None).reason,
            Reason::FlagNotFound
        );
    }

    #[test]
    fn test_enabled_and_disabled_defaults() {
        let evaluator = FlagEvaluator::new();
        evaluator.set_flag("new-feature", Flag::new(true));
        evaluator.set_flag("disabled-feature", Flag::new(false));

        assert!(evaluator.is_enabled("new-feature", None));
        assert!(evaluator.is_enabled("new-feature", Some(&Context::new().with("plan", "free"))));
        assert!(!evaluator.is_enabled("disabled-feature", None));
    }

    #[test]
    fn test_set_flag_replaces() {
        let evaluator = FlagEvaluator::new();
        evaluator.set_flag("critical-feature", Flag::new(true));
        assert!(evaluator.is_enabled("critical-feature", None));

        evaluator.set_flag("critical-feature", Flag::new(false));
        assert!(!evaluator.is_enabled("critical-feature", None));
        assert_eq!(evaluator.len(), 1);
    }

    #[test]
    fn test_reset_is_idempotent() {
        let evaluator = FlagEvaluator::new();
        evaluator.set_flag("a", Flag::new(true));
        evaluator.reset();
        assert!(evaluator.is_empty());
        assert!(!evaluator.is_enabled("a", None));
        evaluator.reset();
        assert!(evaluator.is_empty());
    }

    #[test]
    fn test_registry_helpers() {
        let evaluator = FlagEvaluator::new();
        evaluator.set_flags([("b", Flag::new(true)), ("a", Flag::new(false))]);

        assert_eq!(evaluator.flag_keys(), vec!["a", "b"]);
        assert!(evaluator.contains("a"));
        assert_eq!(evaluator.get_flag("b"), Some(Flag::new(true)));

        assert_eq!(evaluator.remove_flag("a"), Some(Flag::new(false)));
        assert_eq!(evaluator.remove_flag("a"), None);
        assert!(!evaluator.contains("a"));
    }

    #[test]
    fn test_instances_are_independent() {
        let first = FlagEvaluator::new();
        let second = FlagEvaluator::new();
        first.set_flag("shared-name", Flag::new(true));

        assert!(first.is_enabled("shared-name", None));
        assert!(!second.is_enabled("shared-name", None));
    }

    #[test]
    fn test_variant_payload() {
        let evaluator = FlagEvaluator::new();
        evaluator.set_flag(
            "checkout-experiment",
            Flag::new(true)
                .with_variant("control", json!({"buttonColor": "blue"}))
                .with_variant("treatment", json!({"buttonColor": "green"}))
                .with_rule(Rule::new("group", "equals", "B", "treatment"))
                .with_rule(Rule::new("group", "equals", "C", "missing")),
        );

        let group_b = Context::new().with("group", "B");
        assert_eq!(
            evaluator.variant_payload("checkout-experiment", Some(&group_b)),
            Some(json!({"buttonColor": "green"}))
        );
        assert_eq!(
            evaluator.variant_payload("checkout-experiment", None),
            Some(json!({"buttonColor": "blue"}))
        );

        let group_c = Context::new().with("group", "C");
        assert_eq!(
            evaluator.get_variant("checkout-experiment", Some(&group_c)),
            Some("missing".to_string())
        );
        assert_eq!(
            evaluator.variant_payload("checkout-experiment", Some(&group_c)),
            None
        );
    }

    #[test]
    fn test_custom_control_variant() {
        let evaluator = FlagEvaluator::with_config(EvaluatorConfig {
            control_variant: "baseline".to_string(),
            ..EvaluatorConfig::default()
        });
        evaluator.set_flag("exp", Flag::new(true).with_variant("baseline", json!(1)));
        assert_eq!(evaluator.get_variant("exp", None), Some("baseline".to_string()));
    }

    #[test]
    fn test_config_from_json_uses_defaults() {
        let config: EvaluatorConfig = serde_json::from_value(json!({"bucketing": "sha1"})).unwrap();
        assert_eq!(config.bucketing, Bucketing::Sha1);
        assert_eq!(config.user_id_attribute, "userId");
        assert_eq!(config.control_variant, "control");
    }

    #[test]
    fn test_from_directory() {
        let temp = TempDir::new().unwrap();
        create_flags_file(
            temp.path(),
            "flags.json",
            r#"{
                "flags": {
                    "beta-feature": {
                        "enabled": false,
                        "targeting": {"rules": [
                            {"attribute": "email", "operator": "contains", "value": "@beta.com", "variation": "on"}
                        ]}
                    },
                    "new-feature": {"enabled": true}
                }
            }"#,
        );

        let evaluator = FlagEvaluator::from_directory(temp.path()).unwrap();
        assert_eq!(evaluator.flag_keys(), vec!["beta-feature", "new-feature"]);
        let beta = Context::new().with("email", "test@beta.com");
        assert!(evaluator.is_enabled("beta-feature", Some(&beta)));
        assert!(evaluator.is_enabled("new-feature", None));
    }

    #[test]
    fn test_from_missing_directory_is_empty() {
        let temp = TempDir::new().unwrap();
        let evaluator = FlagEvaluator::from_directory(&temp.path().join("missing")).unwrap();
        assert!(evaluator.is_empty());
    }

    #[test]
    fn test_reload_keeps_registry_on_error() {
        let temp = TempDir::new().unwrap();
        create_flags_file(temp.path(), "flags.json", r#"{"flags": {"a": {"enabled": true}}}"#);
        let evaluator = FlagEvaluator::from_directory(temp.path()).unwrap();

        create_flags_file(temp.path(), "broken.json", r#"{"flags": {"b": {"rolloutPercentage": 5}}}"#);
        let result = evaluator.reload_from(temp.path());
        assert!(matches!(
            result,
            Err(FlagsError::Source(ValidationError::SchemaError { .. }))
        ));
        assert!(evaluator.is_enabled("a", None));
        assert!(!evaluator.contains("b"));
    }

    #[test]
    fn test_from_file() {
        let temp = TempDir::new().unwrap();
        create_flags_file(
            temp.path(),
            "toggles-default.json",
            r#"{"flags": {"kill-switch": {"enabled": true}}, "generated_at": "2026-10-19T00:00:00Z"}"#,
        );

        let evaluator = FlagEvaluator::from_file(&temp.path().join("toggles-default.json")).unwrap();
        assert_eq!(evaluator.flag_keys(), vec!["kill-switch"]);
        assert!(evaluator.is_enabled("kill-switch", None));
    }

    #[test]
    fn test_from_missing_file() {
        let temp = TempDir::new().unwrap();
        let result = FlagEvaluator::from_file(&temp.path().join("missing.json"));
        assert!(matches!(
            result,
            Err(FlagsError::Source(ValidationError::FileRead(_)))
        ));
    }

    #[test]
    fn test_invalid_definition_names_the_flag() {
        let documents = FlagDocuments::from([
            ("good".to_string(), json!({"enabled": true})),
            ("bad".to_string(), json!({"enabled": "yes"})),
        ]);
        match build_registry(documents) {
            Err(FlagsError::InvalidFlag { key, .. }) => assert_eq!(key, "bad"),
            other => panic!("Expected InvalidFlag error, got {:?}", other.map(|r| r.len())),
        }
    }

    #[test]
    fn test_reload_replaces_flags() {
        let temp = TempDir::new().unwrap();
        create_flags_file(temp.path(), "flags.json", r#"{"flags": {"a": {"enabled": true}}}"#);
        let evaluator = FlagEvaluator::new();
        evaluator.set_flag("stale", Flag::new(true));

        assert_eq!(evaluator.reload_from(temp.path()).unwrap(), 1);
        assert_eq!(evaluator.flag_keys(), vec!["a"]);
    }

    #[test]
    fn test_evaluator_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<FlagEvaluator>();
    }

    #[test]
    fn test_concurrent_readers_and_writers() {
        let evaluator = Arc::new(FlagEvaluator::new());
        evaluator.set_flag("toggle", Flag::new(true));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let evaluator = Arc::clone(&evaluator);
                std::thread::spawn(move || {
                    for n in 0..200 {
                        if i == 0 {
                            evaluator.set_flag("toggle", Flag::new(n % 2 == 0));
                        } else {
                            // either state is fine, the call must not panic
                            let _ = evaluator.is_enabled("toggle", None);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // writer's last iteration is n = 199
        assert!(!evaluator.is_enabled("toggle", None));
    }
}
