//! Flag definitions and targeting evaluation.
//!
//! Flags are plain data: a default `enabled` state, optional named variants,
//! an ordered list of targeting [`Rule`]s and an optional rollout percentage.
//! This module provides those types plus the evaluation logic used by
//! [`crate::FlagEvaluator`]. Nothing here returns an error: malformed rules
//! and missing context attributes simply do not match.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

use crate::EvaluatorConfig;

/// Variation token that turns a flag on when its rule matches.
pub const VARIATION_ON: &str = "on";

// ContextValue

/// A scalar attribute value, used both in a [`Context`] and as a rule operand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl ContextValue {
    fn as_number(&self) -> Option<f64> {
        match self {
            ContextValue::Int(i) => Some(*i as f64),
            ContextValue::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl fmt::Display for ContextValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextValue::String(s) => write!(f, "{s}"),
            ContextValue::Int(i) => write!(f, "{i}"),
            ContextValue::Float(v) => write!(f, "{v}"),
            ContextValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<&str> for ContextValue {
    fn from(s: &str) -> Self {
        ContextValue::String(s.to_string())
    }
}

impl From<String> for ContextValue {
    fn from(s: String) -> Self {
        ContextValue::String(s)
    }
}

impl From<i64> for ContextValue {
    fn from(i: i64) -> Self {
        ContextValue::Int(i)
    }
}

impl From<i32> for ContextValue {
    fn from(i: i32) -> Self {
        ContextValue::Int(i64::from(i))
    }
}

impl From<f64> for ContextValue {
    fn from(f: f64) -> Self {
        ContextValue::Float(f)
    }
}

impl From<bool> for ContextValue {
    fn from(b: bool) -> Self {
        ContextValue::Bool(b)
    }
}

// Context

/// Attributes describing who or what a flag is evaluated for.
///
/// Supplied per call and never stored by the evaluator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context {
    attributes: HashMap<String, ContextValue>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an attribute.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ContextValue>) {
        self.attributes.insert(key.into(), value.into());
    }

    /// Builder form of [`Context::insert`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<ContextValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&ContextValue> {
        self.attributes.get(key)
    }

    pub fn has(&self, key: &str) -> bool {
        self.attributes.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for Context
where
    K: Into<String>,
    V: Into<ContextValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            attributes: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

// Operator

/// Comparison applied by a [`Rule`].
///
/// Names other than the four known operators are kept as [`Operator::Unknown`]
/// and never match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Operator {
    Equals,
    Contains,
    GreaterThan,
    In,
    Unknown(String),
}

impl Operator {
    pub fn as_str(&self) -> &str {
        match self {
            Operator::Equals => "equals",
            Operator::Contains => "contains",
            Operator::GreaterThan => "greaterThan",
            Operator::In => "in",
            Operator::Unknown(name) => name,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Operator::Unknown(_))
    }
}

impl From<&str> for Operator {
    fn from(name: &str) -> Self {
        match name {
            "equals" => Operator::Equals,
            "contains" => Operator::Contains,
            "greaterThan" => Operator::GreaterThan,
            "in" => Operator::In,
            other => Operator::Unknown(other.to_string()),
        }
    }
}

impl From<String> for Operator {
    fn from(name: String) -> Self {
        Operator::from(name.as_str())
    }
}

impl From<Operator> for String {
    fn from(op: Operator) -> Self {
        match op {
            Operator::Unknown(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// RuleValue

/// Operand of a [`Rule`].
///
/// `in` expects a list, every other operator a scalar. Any other JSON shape
/// is kept as `Other` and matches nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleValue {
    Scalar(ContextValue),
    List(Vec<ContextValue>),
    Other(JsonValue),
}

impl From<ContextValue> for RuleValue {
    fn from(v: ContextValue) -> Self {
        RuleValue::Scalar(v)
    }
}

impl From<&str> for RuleValue {
    fn from(s: &str) -> Self {
        RuleValue::Scalar(s.into())
    }
}

impl From<String> for RuleValue {
    fn from(s: String) -> Self {
        RuleValue::Scalar(s.into())
    }
}

impl From<i64> for RuleValue {
    fn from(i: i64) -> Self {
        RuleValue::Scalar(i.into())
    }
}

impl From<f64> for RuleValue {
    fn from(f: f64) -> Self {
        RuleValue::Scalar(f.into())
    }
}

impl From<bool> for RuleValue {
    fn from(b: bool) -> Self {
        RuleValue::Scalar(b.into())
    }
}

impl From<Vec<ContextValue>> for RuleValue {
    fn from(items: Vec<ContextValue>) -> Self {
        RuleValue::List(items)
    }
}

impl From<Vec<&str>> for RuleValue {
    fn from(items: Vec<&str>) -> Self {
        RuleValue::List(items.into_iter().map(ContextValue::from).collect())
    }
}

impl From<Vec<i64>> for RuleValue {
    fn from(items: Vec<i64>) -> Self {
        RuleValue::List(items.into_iter().map(ContextValue::from).collect())
    }
}

// Rule

/// One targeting condition and the outcome it selects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub attribute: String,
    pub operator: Operator,
    pub value: RuleValue,
    /// `"on"` to enable the flag, otherwise a variant name.
    pub variation: String,
}

impl Rule {
    pub fn new(
        attribute: impl Into<String>,
        operator: impl Into<Operator>,
        value: impl Into<RuleValue>,
        variation: impl Into<String>,
    ) -> Self {
        Self {
            attribute: attribute.into(),
            operator: operator.into(),
            value: value.into(),
            variation: variation.into(),
        }
    }

    /// Whether this rule's predicate holds for `context`.
    pub fn matches(&self, context: &Context) -> bool {
        evaluate_rule(context.get(&self.attribute), &self.operator, &self.value)
    }
}

// Flag

/// A named flag's configuration. The key lives in the registry, not here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flag {
    /// Decision when no rule and no rollout applies.
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Variant name to an opaque payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variants: Option<BTreeMap<String, JsonValue>>,
    /// Rules in evaluation order; the first match wins.
    #[serde(
        default,
        deserialize_with = "deserialize_targeting",
        skip_serializing_if = "Option::is_none"
    )]
    pub targeting: Option<Vec<Rule>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout_percentage: Option<u8>,
}

impl Flag {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Self::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.targeting.get_or_insert_with(Vec::new).push(rule);
        self
    }

    pub fn with_variant(mut self, name: impl Into<String>, payload: JsonValue) -> Self {
        self.variants
            .get_or_insert_with(BTreeMap::new)
            .insert(name.into(), payload);
        self
    }

    pub fn with_rollout(mut self, percentage: u8) -> Self {
        self.rollout_percentage = Some(percentage);
        self
    }
}

/// Targeting is written either as a list of rules or as `{"rules": [...]}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum TargetingData {
    Rules(Vec<Rule>),
    Wrapped { rules: Vec<Rule> },
}

fn deserialize_targeting<'de, D>(deserializer: D) -> Result<Option<Vec<Rule>>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(
        Option::<TargetingData>::deserialize(deserializer)?.map(|data| match data {
            TargetingData::Rules(rules) | TargetingData::Wrapped { rules } => rules,
        }),
    )
}

// Evaluation results

/// Why [`crate::FlagEvaluator::is_enabled_detail`] reached its answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Reason {
    FlagNotFound,
    RuleMatch { index: usize, variation: String },
    Rollout { bucket: u8, percentage: u8 },
    Fallthrough,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reason::FlagNotFound => f.write_str("flag not found"),
            Reason::RuleMatch { index, variation } => {
                write!(f, "rule {index} matched (variation '{variation}')")
            }
            Reason::Rollout { bucket, percentage } => {
                write!(f, "rollout bucket {bucket} against {percentage}%")
            }
            Reason::Fallthrough => f.write_str("default state"),
        }
    }
}

/// Boolean decision together with its [`Reason`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EvaluationDetail {
    pub enabled: bool,
    pub reason: Reason,
}

impl EvaluationDetail {
    pub(crate) fn not_found() -> Self {
        Self {
            enabled: false,
            reason: Reason::FlagNotFound,
        }
    }
}

// Evaluation

/// First rule matching `context`, with its position. Later rules are not evaluated.
pub(crate) fn first_match<'a>(
    flag: &'a Flag,
    context: Option<&Context>,
) -> Option<(usize, &'a Rule)> {
    let (Some(rules), Some(context)) = (flag.targeting.as_deref(), context) else {
        return None;
    };
    rules.iter().enumerate().find(|(_, rule)| rule.matches(context))
}

/// Boolean decision for a flag present in the registry.
pub(crate) fn evaluate_enabled(
    flag_key: &str,
    flag: &Flag,
    context: Option<&Context>,
    config: &EvaluatorConfig,
) -> EvaluationDetail {
    if let Some((index, rule)) = first_match(flag, context) {
        return EvaluationDetail {
            enabled: rule.variation == VARIATION_ON,
            reason: Reason::RuleMatch {
                index,
                variation: rule.variation.clone(),
            },
        };
    }

    if let Some(percentage) = flag.rollout_percentage
        && let Some(user_id) = context.and_then(|ctx| user_id(ctx, config))
    {
        let bucket = config.bucketing.bucket(&user_id, flag_key);
        return EvaluationDetail {
            enabled: bucket < percentage,
            reason: Reason::Rollout { bucket, percentage },
        };
    }

    EvaluationDetail {
        enabled: flag.enabled,
        reason: Reason::Fallthrough,
    }
}

/// Variant name for a flag present in the registry.
///
/// A matching rule's variation is passed through as-is, even when it names
/// no entry in `variants`.
pub(crate) fn resolve_variant(
    flag: &Flag,
    context: Option<&Context>,
    config: &EvaluatorConfig,
) -> Option<String> {
    if flag.variants.is_none() {
        return None;
    }

    if let Some((_, rule)) = first_match(flag, context) {
        return Some(rule.variation.clone());
    }

    flag.enabled.then(|| config.control_variant.clone())
}

/// The user identifier is the configured attribute rendered as a string.
/// Falsy values (`false`, `0`, `""`) count as absent.
fn user_id(context: &Context, config: &EvaluatorConfig) -> Option<String> {
    match context.get(&config.user_id_attribute)? {
        ContextValue::Bool(false) | ContextValue::Int(0) => None,
        ContextValue::Float(f) if *f == 0.0 || f.is_nan() => None,
        ContextValue::String(s) if s.is_empty() => None,
        value => Some(value.to_string()),
    }
}

/// Predicate for a single rule. Missing attributes and operands of the wrong
/// shape never match.
pub(crate) fn evaluate_rule(
    context_value: Option<&ContextValue>,
    operator: &Operator,
    target: &RuleValue,
) -> bool {
    let Some(value) = context_value else {
        return false;
    };
    match (operator, target) {
        (Operator::Equals, RuleValue::Scalar(expected)) => values_equal(value, expected),
        (Operator::Contains, RuleValue::Scalar(ContextValue::String(needle))) => {
            value.to_string().contains(needle.as_str())
        }
        (Operator::GreaterThan, RuleValue::Scalar(bound)) => greater_than(value, bound),
        (Operator::In, RuleValue::List(items)) => {
            items.iter().any(|item| values_equal(value, item))
        }
        _ => false,
    }
}

/// Same-type equality. Integers and floats are both numbers and compare by value.
fn values_equal(left: &ContextValue, right: &ContextValue) -> bool {
    match (left, right) {
        (ContextValue::String(a), ContextValue::String(b)) => a == b,
        (ContextValue::Bool(a), ContextValue::Bool(b)) => a == b,
        (ContextValue::Int(a), ContextValue::Int(b)) => a == b,
        _ => match (left.as_number(), right.as_number()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
    }
}

/// Numbers order numerically and strings lexicographically; any other pairing is false.
fn greater_than(left: &ContextValue, right: &ContextValue) -> bool {
    match (left, right) {
        (ContextValue::Int(a), ContextValue::Int(b)) => a > b,
        (ContextValue::String(a), ContextValue::String(b)) => a > b,
        _ => match (left.as_number(), right.as_number()) {
            (Some(a), Some(b)) => a > b,
            _ => false,
        },
    }
}
