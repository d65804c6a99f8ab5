//! Predicate, ordering, paging and aggregate description of a data command.
//!
//! Translating a [`Query`] into a server-specific statement is the business of a
//! [`DatabaseProvider`](crate::shard::DatabaseProvider). This module only carries what the cache policy and the
//! shard coordinator need to reason about: which fields are bound to which values, the requested order and size, and
//! an in-memory evaluator used for residual filtering and cross-shard re-sorting.

use std::cmp::Ordering;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// A record as seen by the cache and the providers: a JSON object keyed by field name.
pub type Record = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
pub enum Operator {
    Eq,
    Ne,
    In,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field:    String,
    pub operator: Operator,
    pub value:    Value,
}

impl Condition {
    pub fn new<S: Into<String>, V: Into<Value>>(field: S, operator: Operator, value: V) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    /// The values the field is pinned to, if the condition is an equality or a membership test.
    pub fn bound_values(&self) -> Option<Vec<&Value>> {
        match self.operator {
            Operator::Eq => Some(vec![&self.value]),
            Operator::In => match &self.value {
                Value::Array(values) => Some(values.iter().collect()),
                single => Some(vec![single]),
            },
            _ => None,
        }
    }

    pub fn is_equality(&self) -> bool {
        self.operator == Operator::Eq
    }

    pub fn matches(&self, record: &Record) -> bool {
        let actual = record.get(&self.field).unwrap_or(&Value::Null);
        match self.operator {
            Operator::Eq => values_equal(actual, &self.value),
            Operator::Ne => !values_equal(actual, &self.value),
            Operator::In => match &self.value {
                Value::Array(values) => values.iter().any(|v| values_equal(actual, v)),
                single => values_equal(actual, single),
            },
            Operator::Gt => !actual.is_null() && compare_values(actual, &self.value) == Ordering::Greater,
            Operator::Ge => !actual.is_null() && compare_values(actual, &self.value) != Ordering::Less,
            Operator::Lt => !actual.is_null() && compare_values(actual, &self.value) == Ordering::Less,
            Operator::Le => !actual.is_null() && compare_values(actual, &self.value) != Ordering::Greater,
            Operator::Contains => match (actual, &self.value) {
                (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
                (Value::Array(items), needle) => items.iter().any(|v| values_equal(v, needle)),
                _ => false,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    pub field:     String,
    pub direction: SortDirection,
}

/// 1-based page number and page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Paging {
    pub page:      usize,
    pub page_size: usize,
}

impl Paging {
    /// Offset of the first record of the page in the globally ordered result.
    pub fn offset(&self) -> usize {
        self.page.saturating_sub(1) * self.page_size
    }

    /// How many leading records a shard must return for the page to be complete.
    pub fn fetch_window(&self) -> usize {
        self.page.max(1) * self.page_size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
pub enum AggregateOp {
    Max,
    Min,
    Sum,
    Count,
    Avg,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregate {
    pub op:    AggregateOp,
    pub field: String,
}

/// Describes which records a command targets and how the result must be shaped.
///
/// `size == 0` means "no limit".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    conditions: Vec<Condition>,
    complex:    bool,
    sorts:      Vec<Sort>,
    size:       usize,
    paging:     Option<Paging>,
    aggregate:  Option<Aggregate>,
}

impl Query {
    /// The "match everything" predicate.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn filter(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn and_eq<S: Into<String>, V: Into<Value>>(self, field: S, value: V) -> Self {
        self.filter(Condition::new(field, Operator::Eq, value))
    }

    pub fn and_in<S, I, V>(self, field: S, values: I) -> Self
    where
        S: Into<String>,
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values = values.into_iter().map(Into::into).collect::<Vec<Value>>();
        self.filter(Condition::new(field, Operator::In, Value::Array(values)))
    }

    /// Marks the predicate as something the key model cannot represent: joins, subqueries, computed expressions.
    pub fn complex(mut self) -> Self {
        self.complex = true;
        self
    }

    pub fn order_by<S: Into<String>>(mut self, field: S, direction: SortDirection) -> Self {
        self.sorts.push(Sort {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn page(mut self, page: usize, page_size: usize) -> Self {
        self.paging = Some(Paging { page, page_size });
        self
    }

    pub fn aggregate<S: Into<String>>(mut self, op: AggregateOp, field: S) -> Self {
        self.aggregate = Some(Aggregate {
            op,
            field: field.into(),
        });
        self
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn is_complex(&self) -> bool {
        self.complex
    }

    pub fn sorts(&self) -> &[Sort] {
        &self.sorts
    }

    pub fn is_sorted(&self) -> bool {
        !self.sorts.is_empty()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn paging(&self) -> Option<Paging> {
        self.paging
    }

    pub fn aggregate_spec(&self) -> Option<&Aggregate> {
        self.aggregate.as_ref()
    }

    pub fn is_match_all(&self) -> bool {
        self.conditions.is_empty() && !self.complex
    }

    /// A copy of this query asking for a different page window. The original is left intact.
    pub fn with_paging(&self, page: usize, page_size: usize) -> Self {
        Self {
            paging: Some(Paging { page, page_size }),
            ..self.clone()
        }
    }

    pub fn with_size(&self, size: usize) -> Self {
        Self { size, ..self.clone() }
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.conditions.iter().all(|c| c.matches(record))
    }

    pub fn compare_records(&self, a: &Record, b: &Record) -> Ordering {
        for sort in &self.sorts {
            let left = a.get(&sort.field).unwrap_or(&Value::Null);
            let right = b.get(&sort.field).unwrap_or(&Value::Null);
            let ord = match sort.direction {
                SortDirection::Asc => compare_values(left, right),
                SortDirection::Desc => compare_values(right, left),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// Stable sort by the requested order; a no-op for unordered queries.
    pub fn sort_records(&self, records: &mut [Record]) {
        if self.is_sorted() {
            records.sort_by(|a, b| self.compare_records(a, b));
        }
    }
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values. Values of different kinds are ordered by kind, nulls first.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                x.cmp(&y)
            }
            else if let (Some(x), Some(y)) = (x.as_u64(), y.as_u64()) {
                x.cmp(&y)
            }
            else {
                let x = x.as_f64().unwrap_or(f64::NAN);
                let y = y.as_f64().unwrap_or(f64::NAN);
                x.total_cmp(&y)
            }
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let ord = compare_values(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => x.len().cmp(&y.len()).then_with(|| a.to_string().cmp(&b.to_string())),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => compare_values(a, b) == Ordering::Equal,
        _ => a == b,
    }
}
