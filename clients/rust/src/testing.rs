//! Testing utilities for temporarily overriding flag definitions.
//!
//! # Example
//!
//! ```rust
//! use toggles::testing::override_flags;
//! use toggles::{Flag, FlagEvaluator};
//!
//! let evaluator = FlagEvaluator::new();
//! evaluator.set_flag("new-checkout", Flag::new(false));
//!
//! {
//!     let _guard = override_flags(&evaluator, &[("new-checkout", Flag::new(true))]);
//!     assert!(evaluator.is_enabled("new-checkout", None));
//! }
//!
//! assert!(!evaluator.is_enabled("new-checkout", None));
//! ```

use crate::{Flag, FlagEvaluator};

/// Guard that restores the overridden flags when dropped.
#[must_use = "overrides are reverted as soon as the guard is dropped"]
pub struct OverrideGuard<'a> {
    evaluator: &'a FlagEvaluator,
    previous: Vec<(String, Option<Flag>)>,
}

impl Drop for OverrideGuard<'_> {
    fn drop(&mut self) {
        // reverse order so a key overridden twice ends at its original value
        for (key, prev) in self.previous.drain(..).rev() {
            match prev {
                Some(flag) => self.evaluator.set_flag(key, flag),
                None => {
                    self.evaluator.remove_flag(&key);
                }
            }
        }
    }
}

/// Install `overrides` on `evaluator` for the lifetime of the returned guard.
///
/// When the guard is dropped every key gets its previous definition back,
/// and keys that did not exist before are removed. Guards nest.
///
/// # Note
///
/// Overrides change the evaluator itself, so every thread sharing it sees
/// them while the guard is alive.
pub fn override_flags<'a>(
    evaluator: &'a FlagEvaluator,
    overrides: &[(&str, Flag)],
) -> OverrideGuard<'a> {
    let mut previous = Vec::with_capacity(overrides.len());
    for (key, flag) in overrides {
        previous.push((key.to_string(), evaluator.get_flag(key)));
        evaluator.set_flag(*key, flag.clone());
    }
    OverrideGuard {
        evaluator,
        previous,
    }
}

/// Force `key` on or off for the lifetime of the returned guard.
pub fn force_flag<'a>(evaluator: &'a FlagEvaluator, key: &str, enabled: bool) -> OverrideGuard<'a> {
    override_flags(evaluator, &[(key, Flag::new(enabled))])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Context, Rule};

    #[test]
    fn test_override_guard_restores() {
        let evaluator = FlagEvaluator::new();
        evaluator.set_flag("key", Flag::new(false));

        {
            let _guard = override_flags(&evaluator, &[("key", Flag::new(true))]);
            assert!(evaluator.is_enabled("key", None));
        }

        assert_eq!(evaluator.get_flag("key"), Some(Flag::new(false)));
    }

    #[test]
    fn test_override_guard_removes_new_key() {
        let evaluator = FlagEvaluator::new();
        assert!(!evaluator.contains("new_key"));

        {
            let _guard = force_flag(&evaluator, "new_key", true);
            assert!(evaluator.is_enabled("new_key", None));
        }

        assert!(!evaluator.contains("new_key"));
    }

    #[test]
    fn test_nested_overrides() {
        let evaluator = FlagEvaluator::new();
        {
            let _outer = force_flag(&evaluator, "key", true);
            assert!(evaluator.is_enabled("key", None));

            {
                let _inner = force_flag(&evaluator, "key", false);
                assert!(!evaluator.is_enabled("key", None));
            }

            assert!(evaluator.is_enabled("key", None));
        }

        assert!(!evaluator.contains("key"));
    }

    #[test]
    fn test_same_key_twice_in_one_override() {
        let evaluator = FlagEvaluator::new();
        evaluator.set_flag("key", Flag::new(true).with_description("original"));

        {
            let _guard = override_flags(
                &evaluator,
                &[("key", Flag::new(false)), ("key", Flag::new(false).with_rollout(5))],
            );
            assert_eq!(evaluator.get_flag("key").unwrap().rollout_percentage, Some(5));
        }

        assert_eq!(
            evaluator.get_flag("key").unwrap().description.as_deref(),
            Some("original")
        );
    }

    #[test]
    fn test_override_with_targeting() {
        let evaluator = FlagEvaluator::new();
        let beta = Context::new().with("plan", "beta");

        let _guard = override_flags(
            &evaluator,
            &[(
                "beta-only",
                Flag::new(false).with_rule(Rule::new("plan", "equals", "beta", "on")),
            )],
        );
        assert!(evaluator.is_enabled("beta-only", Some(&beta)));
        assert!(!evaluator.is_enabled("beta-only", None));
    }
}
