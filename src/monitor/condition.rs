//! Declarative conditions evaluated against a check context.

use serde::{Deserialize, Serialize};

use crate::checker::{Context, ContextValue};

/// Comparison operator of a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "not_contains")]
    NotContains,
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Operator::Eq => "==",
            Operator::Ne => "!=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Contains => "contains",
            Operator::NotContains => "not_contains",
        };
        f.write_str(s)
    }
}

/// A single rule such as `STATUS_CODE == 200`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub key: String,
    pub operator: Operator,
    pub expected_value: ContextValue,
}

impl Condition {
    pub fn new(key: &str, operator: Operator, expected_value: impl Into<ContextValue>) -> Self {
        Self {
            key: key.to_string(),
            operator,
            expected_value: expected_value.into(),
        }
    }

    /// Whether the condition holds for `context`. Missing keys never hold.
    pub fn matches(&self, context: &Context) -> bool {
        let Some(actual) = context.get(&self.key) else {
            return false;
        };
        let expected = &self.expected_value;

        match self.operator {
            Operator::Eq => values_equal(actual, expected),
            Operator::Ne => !values_equal(actual, expected),
            Operator::Lt => compare_numbers(actual, expected, |a, b| a < b),
            Operator::Le => compare_numbers(actual, expected, |a, b| a <= b),
            Operator::Gt => compare_numbers(actual, expected, |a, b| a > b),
            Operator::Ge => compare_numbers(actual, expected, |a, b| a >= b),
            Operator::Contains => contains(actual, expected),
            Operator::NotContains => !contains(actual, expected),
        }
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.key, self.operator, self.expected_value)
    }
}

/// Outcome of one condition, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionResult {
    pub condition: String,
    pub success: bool,
}

/// Evaluate every condition against `context`, in declaration order.
pub fn evaluate(conditions: &[Condition], context: &Context) -> Vec<ConditionResult> {
    conditions
        .iter()
        .map(|c| ConditionResult {
            condition: c.to_string(),
            success: c.matches(context),
        })
        .collect()
}

fn values_equal(actual: &ContextValue, expected: &ContextValue) -> bool {
    match (actual, expected) {
        (ContextValue::Bool(a), ContextValue::Bool(b)) => a == b,
        (ContextValue::Text(a), ContextValue::Text(b)) => a == b,
        (ContextValue::List(a), ContextValue::List(b)) => a == b,
        (ContextValue::Bool(a), ContextValue::Text(b)) | (ContextValue::Text(b), ContextValue::Bool(a)) => {
            b.trim().eq_ignore_ascii_case(if *a { "true" } else { "false" })
        }
        _ => match (actual.as_number(), expected.as_number()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
    }
}

fn compare_numbers(actual: &ContextValue, expected: &ContextValue, cmp: fn(f64, f64) -> bool) -> bool {
    match (actual.as_number(), expected.as_number()) {
        (Some(a), Some(b)) => cmp(a, b),
        _ => false,
    }
}

fn contains(actual: &ContextValue, expected: &ContextValue) -> bool {
    match actual {
        ContextValue::List(items) => items.iter().any(|item| {
            values_equal(item, expected) || contains_text(item, expected)
        }),
        other => contains_text(other, expected),
    }
}

fn contains_text(actual: &ContextValue, expected: &ContextValue) -> bool {
    match actual {
        ContextValue::Text(s) => s.contains(&expected.to_string()),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(entries: &[(&str, ContextValue)]) -> Context {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_status_code_equality() {
        let ctx = context(&[("STATUS_CODE", ContextValue::Number(200.0))]);

        let pass = evaluate(&[Condition::new("STATUS_CODE", Operator::Eq, 200u16)], &ctx);
        assert_eq!(pass, vec![ConditionResult { condition: "STATUS_CODE == 200".into(), success: true }]);

        let fail = evaluate(&[Condition::new("STATUS_CODE", Operator::Eq, 500u16)], &ctx);
        assert!(!fail[0].success);
    }

    #[test]
    fn test_missing_key_is_failure() {
        let ctx = context(&[("CONNECTED", ContextValue::Bool(true))]);
        let results = evaluate(&[Condition::new("STATUS_CODE", Operator::Ne, 500u16)], &ctx);
        assert!(!results[0].success);
    }

    #[test]
    fn test_numeric_comparisons_coerce_text() {
        let ctx = context(&[("RESPONSE_TIME", ContextValue::Number(120.0))]);
        assert!(Condition::new("RESPONSE_TIME", Operator::Lt, "500").matches(&ctx));
        assert!(Condition::new("RESPONSE_TIME", Operator::Ge, 120.0).matches(&ctx));
        assert!(!Condition::new("RESPONSE_TIME", Operator::Gt, 120.0).matches(&ctx));
        assert!(!Condition::new("RESPONSE_TIME", Operator::Lt, "fast").matches(&ctx));
    }

    #[test]
    fn test_contains_on_text_and_lists() {
        let ctx = context(&[
            ("BODY", ContextValue::from("{\"status\":\"ok\"}")),
            ("DNS_RECORDS", ContextValue::from(vec!["1.2.3.4".to_string(), "5.6.7.8".to_string()])),
        ]);
        assert!(Condition::new("BODY", Operator::Contains, "\"ok\"").matches(&ctx));
        assert!(Condition::new("BODY", Operator::NotContains, "error").matches(&ctx));
        assert!(Condition::new("DNS_RECORDS", Operator::Contains, "5.6.7.8").matches(&ctx));
        assert!(!Condition::new("DNS_RECORDS", Operator::Contains, "9.9.9.9").matches(&ctx));
    }

    #[test]
    fn test_bool_equality_accepts_text() {
        let ctx = context(&[("CONNECTED", ContextValue::Bool(true))]);
        assert!(Condition::new("CONNECTED", Operator::Eq, true).matches(&ctx));
        assert!(Condition::new("CONNECTED", Operator::Eq, "true").matches(&ctx));
        assert!(Condition::new("CONNECTED", Operator::Ne, false).matches(&ctx));
    }

    #[test]
    fn test_all_conditions_evaluated_in_order() {
        let ctx = context(&[("STATUS_CODE", ContextValue::Number(404.0))]);
        let results = evaluate(
            &[
                Condition::new("STATUS_CODE", Operator::Eq, 200u16),
                Condition::new("STATUS_CODE", Operator::Lt, 500u16),
            ],
            &ctx,
        );
        assert_eq!(results.len(), 2);
        assert!(!results[0].success);
        assert!(results[1].success);
        assert_eq!(results[1].condition, "STATUS_CODE < 500");
    }

    #[test]
    fn test_condition_json_shape() {
        let c: Condition =
            serde_json::from_str(r#"{"key":"BODY","operator":"contains","expectedValue":"ok"}"#).unwrap();
        assert_eq!(c, Condition::new("BODY", Operator::Contains, "ok"));
    }
}
