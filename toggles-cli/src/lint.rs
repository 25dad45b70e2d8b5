//! Warnings for flag definitions that are valid but will not behave as
//! their author most likely intended.

use std::fmt;

use toggles::features::VARIATION_ON;
use toggles::{ContextValue, Flag, Operator, RuleValue};

use crate::{Result, TargetMap, output::merge_flags_for_target};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LintWarning {
    pub target: String,
    pub flag: String,
    pub rule: usize,
    pub message: String,
}

impl fmt::Display for LintWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "warning: [{}] {} rule {}: {}",
            self.target, self.flag, self.rule, self.message
        )
    }
}

/// Lint the merged flags of every target, sorted by target then flag key.
pub fn lint_targets(maps: &TargetMap) -> Result<Vec<LintWarning>> {
    let mut targets: Vec<&String> = maps.keys().collect();
    targets.sort();

    let mut warnings = Vec::new();
    for target in targets {
        for (key, definition) in merge_flags_for_target(maps, target)? {
            let flag: Flag = serde_json::from_value(definition)?;
            for (rule, message) in lint_flag(&flag) {
                warnings.push(LintWarning {
                    target: target.clone(),
                    flag: key.clone(),
                    rule,
                    message,
                });
            }
        }
    }
    Ok(warnings)
}

/// Findings for one flag as `(rule index, message)`.
pub fn lint_flag(flag: &Flag) -> Vec<(usize, String)> {
    let mut findings = Vec::new();
    let rules = flag.targeting.as_deref().unwrap_or_default();

    for (index, rule) in rules.iter().enumerate() {
        let mut warn = |message: String| findings.push((index, message));

        match (&rule.operator, &rule.value) {
            (Operator::Unknown(name), _) => {
                warn(format!("unknown operator '{name}' never matches"));
            }
            (Operator::In, RuleValue::List(_)) => {}
            (Operator::In, _) => warn("'in' needs a list operand and never matches".to_string()),
            (Operator::Contains, RuleValue::Scalar(ContextValue::String(_))) => {}
            (Operator::Contains, _) => {
                warn("'contains' needs a string operand and never matches".to_string());
            }
            (_, RuleValue::Scalar(_)) => {}
            (op, _) => warn(format!("'{op}' needs a scalar operand and never matches")),
        }

        if let Some(variants) = &flag.variants
            && rule.variation != VARIATION_ON
            && !variants.contains_key(&rule.variation)
        {
            warn(format!(
                "variation '{}' is not a declared variant",
                rule.variation
            ));
        }

        if let Some(earlier) = rules[..index].iter().position(|r| {
            r.attribute == rule.attribute && r.operator == rule.operator && r.value == rule.value
        }) {
            warn(format!("shadowed by rule {earlier} with the same condition"));
        }
    }

    findings
}
