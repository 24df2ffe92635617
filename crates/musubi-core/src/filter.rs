//! Filter expressions for listing records.
//!
//! An [`Expression`] is an AND/OR tree of atomic rules. It is evaluated
//! against the JSON form of a record, so any `Serialize` row can be filtered
//! by its field names.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How the rules of an [`Expression`] combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicOp {
    And,
    Or,
}

/// Comparison applied by an atomic rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    /// Field equals the value.
    Equal,
    /// Field differs from the value.
    NotEqual,
    /// Field equals one element of the array value.
    In,
    /// Field equals none of the elements of the array value.
    NotIn,
    /// Array field holds the value, or string field contains it.
    Contains,
}

/// A single comparison on one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomRule {
    pub field: String,
    pub op: Operator,
    pub value: Value,
}

/// Either an atomic comparison or a nested expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Rule {
    Atom(AtomRule),
    Nested(Expression),
}

/// AND/OR combination of rules.
///
/// # Examples
///
/// ```
/// use musubi_core::{Expression, Rule};
/// use serde_json::json;
///
/// let filter = Expression::and([
///     Rule::equal("state", "pending"),
///     Rule::is_in("name", ["create_lb", "delete_lb"]),
/// ]);
/// assert!(filter.matches(&json!({"state": "pending", "name": "create_lb"})));
/// assert!(!filter.matches(&json!({"state": "running", "name": "create_lb"})));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expression {
    pub op: LogicOp,
    pub rules: Vec<Rule>,
}

impl Rule {
    /// `field == value`
    pub fn equal(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::atom(field, Operator::Equal, value.into())
    }

    /// `field != value`
    pub fn not_equal(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::atom(field, Operator::NotEqual, value.into())
    }

    /// `field ∈ values`
    pub fn is_in<I, V>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::atom(field, Operator::In, Value::Array(values.into_iter().map(Into::into).collect()))
    }

    /// `field ∉ values`
    pub fn not_in<I, V>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::atom(field, Operator::NotIn, Value::Array(values.into_iter().map(Into::into).collect()))
    }

    /// `field` holds or contains `value`
    pub fn contains(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::atom(field, Operator::Contains, value.into())
    }

    fn atom(field: impl Into<String>, op: Operator, value: Value) -> Self {
        Rule::Atom(AtomRule {
            field: field.into(),
            op,
            value,
        })
    }

    fn evaluate(&self, record: &Value) -> bool {
        match self {
            Rule::Atom(atom) => atom.evaluate(record),
            Rule::Nested(expr) => expr.evaluate(record),
        }
    }
}

impl AtomRule {
    fn evaluate(&self, record: &Value) -> bool {
        let field = lookup(record, &self.field);
        match self.op {
            Operator::Equal => field == Some(&self.value),
            Operator::NotEqual => field != Some(&self.value),
            Operator::In => match (&self.value, field) {
                (Value::Array(values), Some(field)) => values.contains(field),
                _ => false,
            },
            Operator::NotIn => match (&self.value, field) {
                (Value::Array(values), Some(field)) => !values.contains(field),
                (Value::Array(_), None) => true,
                _ => false,
            },
            Operator::Contains => match (field, &self.value) {
                (Some(Value::Array(items)), value) => items.contains(value),
                (Some(Value::String(s)), Value::String(needle)) => s.contains(needle.as_str()),
                _ => false,
            },
        }
    }
}

/// Resolves a dotted path such as `reason.message`.
fn lookup<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(record, |value, key| value.get(key))
}

impl Expression {
    /// All rules must match.
    pub fn and(rules: impl IntoIterator<Item = Rule>) -> Self {
        Self {
            op: LogicOp::And,
            rules: rules.into_iter().collect(),
        }
    }

    /// At least one rule must match.
    pub fn or(rules: impl IntoIterator<Item = Rule>) -> Self {
        Self {
            op: LogicOp::Or,
            rules: rules.into_iter().collect(),
        }
    }

    /// Matches every record.
    pub fn all() -> Self {
        Self::and([])
    }

    /// Wraps this expression as a rule of an enclosing one.
    pub fn nested(self) -> Rule {
        Rule::Nested(self)
    }

    /// Evaluates the expression against a serializable record.
    ///
    /// A record that fails to serialize matches nothing.
    pub fn matches<T: Serialize>(&self, record: &T) -> bool {
        match serde_json::to_value(record) {
            Ok(value) => self.evaluate(&value),
            Err(_) => false,
        }
    }

    fn evaluate(&self, record: &Value) -> bool {
        match self.op {
            LogicOp::And => self.rules.iter().all(|r| r.evaluate(record)),
            LogicOp::Or => self.rules.iter().any(|r| r.evaluate(record)),
        }
    }
}
