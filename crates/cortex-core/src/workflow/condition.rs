//! Task condition evaluation.
//!
//! Conditions decide whether a task runs or is skipped. Four kinds are
//! supported: `always`, `never`, `context_equals` (dotted-path lookup into
//! the execution context), and `expression` (a JEXL boolean evaluated against
//! the context as JSON). Unknown kinds evaluate to true.
//!
//! **Security note:** context values are passed as the JEXL context object,
//! never interpolated into the expression string.

use cortex_types::value::{ContextValue, ValueMap, lookup_path, map_to_json};
use cortex_types::workflow::{ConditionKind, TaskCondition};
use serde_json::{Value, json};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConditionError {
    #[error("expression condition has no expression")]
    MissingExpression,

    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),
}

// ---------------------------------------------------------------------------
// ConditionEvaluator
// ---------------------------------------------------------------------------

/// Evaluates task conditions against an execution context.
///
/// The JEXL evaluator is built per expression evaluation, so this type holds
/// no state and can be shared freely across tasks.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// JEXL evaluator with the standard transforms registered.
    fn jexl() -> jexl_eval::Evaluator<'static> {
        jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("contains", |args: &[Value]| {
                let found = match (args.first(), args.get(1)) {
                    (Some(Value::String(s)), Some(Value::String(needle))) => s.contains(needle.as_str()),
                    (Some(Value::Array(items)), Some(needle)) => items.contains(needle),
                    (Some(Value::Object(map)), Some(Value::String(key))) => map.contains_key(key),
                    _ => false,
                };
                Ok(json!(found))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            })
    }

    /// Evaluate one condition.
    pub fn evaluate(
        &self,
        condition: &TaskCondition,
        context: &ValueMap,
    ) -> Result<bool, ConditionError> {
        match condition.kind {
            ConditionKind::Always => Ok(true),
            ConditionKind::Never => Ok(false),
            ConditionKind::ContextEquals => Ok(Self::context_equals(condition, context)),
            ConditionKind::Expression => {
                let expression = condition
                    .expression
                    .as_deref()
                    .filter(|e| !e.trim().is_empty())
                    .ok_or(ConditionError::MissingExpression)?;
                self.evaluate_expression(expression, context)
            }
            ConditionKind::Unknown => {
                tracing::warn!("unknown condition type, treating as satisfied");
                Ok(true)
            }
        }
    }

    /// True when every condition holds. Stops at the first false one.
    pub fn evaluate_all(
        &self,
        conditions: &[TaskCondition],
        context: &ValueMap,
    ) -> Result<bool, ConditionError> {
        for condition in conditions {
            if !self.evaluate(condition, context)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Evaluate a JEXL expression and coerce the result with JavaScript-like truthiness.
    pub fn evaluate_expression(
        &self,
        expression: &str,
        context: &ValueMap,
    ) -> Result<bool, ConditionError> {
        let context = map_to_json(context);
        let result = Self::jexl()
            .eval_in_context(expression, &context)
            .map_err(|e| ConditionError::EvalFailed(e.to_string()))?;
        Ok(Self::truthy(&result))
    }

    /// A missing or non-string `key` parameter never matches.
    fn context_equals(condition: &TaskCondition, context: &ValueMap) -> bool {
        let Some(key) = condition.parameters.get("key").and_then(ContextValue::as_str) else {
            return false;
        };
        let expected = condition
            .parameters
            .get("value")
            .cloned()
            .unwrap_or(ContextValue::Null);

        match lookup_path(context, key) {
            Some(actual) => *actual == expected,
            None => expected.is_null(),
        }
    }

    fn truthy(value: &Value) -> bool {
        match value {
            Value::Bool(b) => *b,
            Value::Null => false,
            Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Array(_) | Value::Object(_) => true,
        }
    }
}
