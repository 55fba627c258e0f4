// ============================================================================
// Query Criteria
// ============================================================================
//
// Structured selection criteria evaluated against serialized entity rows.
// A `Query` may reference positional (`?1`, 1-based) or named (`:name`)
// parameters; binding resolves them into a `BoundQuery` that the storage
// engine can evaluate and fingerprint.
//
// ============================================================================

use super::pattern::eval_like;
use crate::core::{PersistError, Result, Row, Value};
use std::cmp::Ordering;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl CompareOp {
    fn holds(&self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::NotEq => ordering != Ordering::Equal,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::LtEq => ordering != Ordering::Greater,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::GtEq => ordering != Ordering::Less,
        }
    }
}

/// Right-hand side of a predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Literal(Value),
    /// 1-based positional parameter
    Positional(usize),
    Named(String),
}

pub fn literal(value: impl Into<Value>) -> Operand {
    Operand::Literal(value.into())
}

pub fn param(position: usize) -> Operand {
    Operand::Positional(position)
}

pub fn named(name: impl Into<String>) -> Operand {
    Operand::Named(name.into())
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Matches every row
    Always,
    Compare {
        attribute: String,
        op: CompareOp,
        operand: Operand,
    },
    Like {
        attribute: String,
        pattern: Operand,
        case_sensitive: bool,
    },
    IsNull(String),
    NotNull(String),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn compare(attribute: impl Into<String>, op: CompareOp, operand: Operand) -> Self {
        Predicate::Compare {
            attribute: attribute.into(),
            op,
            operand,
        }
    }

    pub fn eq(attribute: impl Into<String>, operand: Operand) -> Self {
        Self::compare(attribute, CompareOp::Eq, operand)
    }

    pub fn ne(attribute: impl Into<String>, operand: Operand) -> Self {
        Self::compare(attribute, CompareOp::NotEq, operand)
    }

    pub fn lt(attribute: impl Into<String>, operand: Operand) -> Self {
        Self::compare(attribute, CompareOp::Lt, operand)
    }

    pub fn le(attribute: impl Into<String>, operand: Operand) -> Self {
        Self::compare(attribute, CompareOp::LtEq, operand)
    }

    pub fn gt(attribute: impl Into<String>, operand: Operand) -> Self {
        Self::compare(attribute, CompareOp::Gt, operand)
    }

    pub fn ge(attribute: impl Into<String>, operand: Operand) -> Self {
        Self::compare(attribute, CompareOp::GtEq, operand)
    }

    pub fn like(attribute: impl Into<String>, pattern: Operand) -> Self {
        Predicate::Like {
            attribute: attribute.into(),
            pattern,
            case_sensitive: true,
        }
    }

    /// Case-insensitive LIKE (`lower(attr) like lower(pattern)`).
    pub fn ilike(attribute: impl Into<String>, pattern: Operand) -> Self {
        Predicate::Like {
            attribute: attribute.into(),
            pattern,
            case_sensitive: false,
        }
    }

    pub fn is_null(attribute: impl Into<String>) -> Self {
        Predicate::IsNull(attribute.into())
    }

    pub fn not_null(attribute: impl Into<String>) -> Self {
        Predicate::NotNull(attribute.into())
    }

    pub fn and(self, other: Predicate) -> Self {
        match self {
            Predicate::Always => other,
            Predicate::And(mut parts) => {
                parts.push(other);
                Predicate::And(parts)
            }
            this => Predicate::And(vec![this, other]),
        }
    }

    pub fn or(self, other: Predicate) -> Self {
        match self {
            Predicate::Or(mut parts) => {
                parts.push(other);
                Predicate::Or(parts)
            }
            this => Predicate::Or(vec![this, other]),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Predicate::Not(Box::new(self))
    }

    fn bind(&self, binder: &dyn Fn(&Operand) -> Result<Value>) -> Result<Predicate> {
        Ok(match self {
            Predicate::Always => Predicate::Always,
            Predicate::Compare {
                attribute,
                op,
                operand,
            } => Predicate::Compare {
                attribute: attribute.clone(),
                op: *op,
                operand: Operand::Literal(binder(operand)?),
            },
            Predicate::Like {
                attribute,
                pattern,
                case_sensitive,
            } => Predicate::Like {
                attribute: attribute.clone(),
                pattern: Operand::Literal(binder(pattern)?),
                case_sensitive: *case_sensitive,
            },
            Predicate::IsNull(attribute) => Predicate::IsNull(attribute.clone()),
            Predicate::NotNull(attribute) => Predicate::NotNull(attribute.clone()),
            Predicate::And(parts) => Predicate::And(
                parts
                    .iter()
                    .map(|p| p.bind(binder))
                    .collect::<Result<Vec<_>>>()?,
            ),
            Predicate::Or(parts) => Predicate::Or(
                parts
                    .iter()
                    .map(|p| p.bind(binder))
                    .collect::<Result<Vec<_>>>()?,
            ),
            Predicate::Not(inner) => Predicate::Not(Box::new(inner.bind(binder)?)),
        })
    }

    /// Evaluate a bound predicate. Comparisons against NULL never match.
    fn evaluate(&self, row: &Row) -> Result<bool> {
        match self {
            Predicate::Always => Ok(true),
            Predicate::Compare {
                attribute,
                op,
                operand,
            } => {
                let left = attribute_value(row, attribute);
                let right = literal_of(operand)?;
                if left.is_null() || right.is_null() {
                    return Ok(false);
                }
                Ok(op.holds(left.compare(right)?))
            }
            Predicate::Like {
                attribute,
                pattern,
                case_sensitive,
            } => {
                let text = attribute_value(row, attribute);
                let pattern = literal_of(pattern)?;
                match (&text, pattern) {
                    (Value::Null, _) | (_, Value::Null) => Ok(false),
                    (Value::Text(text), Value::Text(pattern)) => {
                        eval_like(text, pattern, *case_sensitive)
                    }
                    (other, Value::Text(_)) => Err(PersistError::TypeMismatch(format!(
                        "LIKE requires a text attribute, '{}' is {}",
                        attribute,
                        other.type_name()
                    ))),
                    (_, other) => Err(PersistError::TypeMismatch(format!(
                        "LIKE pattern must be text, got {}",
                        other.type_name()
                    ))),
                }
            }
            Predicate::IsNull(attribute) => Ok(attribute_value(row, attribute).is_null()),
            Predicate::NotNull(attribute) => Ok(!attribute_value(row, attribute).is_null()),
            Predicate::And(parts) => {
                for part in parts {
                    if !part.evaluate(row)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Predicate::Or(parts) => {
                for part in parts {
                    if part.evaluate(row)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Predicate::Not(inner) => Ok(!inner.evaluate(row)?),
        }
    }
}

fn literal_of(operand: &Operand) -> Result<&Value> {
    match operand {
        Operand::Literal(value) => Ok(value),
        other => Err(PersistError::Validation(format!(
            "Query parameter {:?} is not bound",
            other
        ))),
    }
}

/// Resolve a dotted attribute path (`author.name`) inside a row.
pub fn attribute_value(row: &Row, path: &str) -> Value {
    let mut current = row;
    for segment in path.split('.') {
        match current.get(segment) {
            Some(next) => current = next,
            None => return Value::Null,
        }
    }
    Value::from_json(current)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub attribute: String,
    pub descending: bool,
}

/// Selection criteria for `find_by_query` / `count_by_query`.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    predicate: Predicate,
    order_by: Vec<OrderBy>,
}

impl Default for Query {
    fn default() -> Self {
        Self::all()
    }
}

impl Query {
    pub fn all() -> Self {
        Self {
            predicate: Predicate::Always,
            order_by: Vec::new(),
        }
    }

    pub fn filter(predicate: Predicate) -> Self {
        Self {
            predicate,
            order_by: Vec::new(),
        }
    }

    pub fn and_where(mut self, predicate: Predicate) -> Self {
        self.predicate = self.predicate.and(predicate);
        self
    }

    pub fn order_by(mut self, attribute: impl Into<String>) -> Self {
        self.order_by.push(OrderBy {
            attribute: attribute.into(),
            descending: false,
        });
        self
    }

    pub fn order_by_desc(mut self, attribute: impl Into<String>) -> Self {
        self.order_by.push(OrderBy {
            attribute: attribute.into(),
            descending: true,
        });
        self
    }

    pub fn predicate(&self) -> &Predicate {
        &self.predicate
    }

    /// Bind `?1..?n` to `params[0..n-1]`.
    pub fn bind_positional(&self, params: &[Value]) -> Result<BoundQuery> {
        let binder = |operand: &Operand| -> Result<Value> {
            match operand {
                Operand::Literal(value) => Ok(value.clone()),
                Operand::Positional(0) => Err(PersistError::Validation(
                    "Positional parameters are numbered from 1".into(),
                )),
                Operand::Positional(position) => {
                    params.get(position - 1).cloned().ok_or_else(|| {
                        PersistError::Validation(format!(
                            "No value bound for positional parameter ?{} ({} supplied)",
                            position,
                            params.len()
                        ))
                    })
                }
                Operand::Named(name) => Err(PersistError::Validation(format!(
                    "Named parameter :{} used with positional binding",
                    name
                ))),
            }
        };
        self.bind_with(&binder)
    }

    pub fn bind_named(&self, params: &HashMap<String, Value>) -> Result<BoundQuery> {
        let binder = |operand: &Operand| -> Result<Value> {
            match operand {
                Operand::Literal(value) => Ok(value.clone()),
                Operand::Named(name) => params.get(name).cloned().ok_or_else(|| {
                    PersistError::Validation(format!(
                        "No value bound for named parameter :{}",
                        name
                    ))
                }),
                Operand::Positional(position) => Err(PersistError::Validation(format!(
                    "Positional parameter ?{} used with named binding",
                    position
                ))),
            }
        };
        self.bind_with(&binder)
    }

    fn bind_with(&self, binder: &dyn Fn(&Operand) -> Result<Value>) -> Result<BoundQuery> {
        Ok(BoundQuery {
            predicate: self.predicate.bind(binder)?,
            order_by: self.order_by.clone(),
        })
    }
}

/// A query whose parameters have all been resolved to values.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundQuery {
    predicate: Predicate,
    order_by: Vec<OrderBy>,
}

impl BoundQuery {
    pub fn all() -> Self {
        Self {
            predicate: Predicate::Always,
            order_by: Vec::new(),
        }
    }

    pub fn matches(&self, row: &Row) -> Result<bool> {
        self.predicate.evaluate(row)
    }

    /// Stable sort: rows with equal keys keep their incoming order.
    pub fn sort(&self, rows: &mut [Row]) {
        if self.order_by.is_empty() {
            return;
        }
        rows.sort_by(|a, b| {
            for order in &self.order_by {
                let left = attribute_value(a, &order.attribute);
                let right = attribute_value(b, &order.attribute);
                let ordering = if order.descending {
                    right.cmp(&left)
                } else {
                    left.cmp(&right)
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });
    }

    /// Stable cache key for the query result cache.
    pub fn fingerprint(&self) -> String {
        format!("{:?}", self)
    }
}

/// Pagination window. Negative inputs mean "not set".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct QueryRange {
    pub first_result: Option<usize>,
    pub max_results: Option<usize>,
}

impl QueryRange {
    pub fn new(first_result: i64, max_results: i64) -> Self {
        Self {
            first_result: usize::try_from(first_result).ok(),
            max_results: usize::try_from(max_results).ok(),
        }
    }

    pub fn all() -> Self {
        Self::default()
    }

    pub fn apply<T>(&self, items: Vec<T>) -> Vec<T> {
        let skip = self.first_result.unwrap_or(0);
        let take = self.max_results.unwrap_or(usize::MAX);
        items.into_iter().skip(skip).take(take).collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryHints {
    pub cacheable: bool,
}

impl QueryHints {
    pub fn cacheable(cacheable: bool) -> Self {
        Self { cacheable }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn posts() -> Vec<Row> {
        vec![
            json!({"id": 1, "title": "Hibernate Tips", "views": 10, "author": {"name": "vlad"}}),
            json!({"id": 2, "title": "Rust in Action", "views": 30, "author": {"name": "tim"}}),
            json!({"id": 3, "title": "tips and tricks", "views": null, "author": null}),
        ]
    }

    fn select(bound: &BoundQuery) -> Vec<i64> {
        let mut rows: Vec<Row> = posts()
            .into_iter()
            .filter(|row| bound.matches(row).unwrap())
            .collect();
        bound.sort(&mut rows);
        rows.iter().filter_map(|r| r["id"].as_i64()).collect()
    }

    #[test]
    fn test_positional_like_is_one_based() {
        let query = Query::filter(Predicate::ilike("title", param(1))).order_by_desc("id");
        let bound = query.bind_positional(&[Value::from("%tips%")]).unwrap();
        assert_eq!(select(&bound), vec![3, 1]);
    }

    #[test]
    fn test_unbound_parameters_are_rejected() {
        let query = Query::filter(Predicate::eq("id", param(2)));
        let err = query.bind_positional(&[Value::Integer(1)]).unwrap_err();
        assert!(err.is_validation());

        let zero = Query::filter(Predicate::eq("id", param(0)));
        assert!(zero.bind_positional(&[Value::Integer(1)]).is_err());

        let named_query = Query::filter(Predicate::eq("id", named("id")));
        assert!(named_query.bind_named(&HashMap::new()).is_err());
    }

    #[test]
    fn test_named_parameters_and_nested_attributes() {
        let query = Query::filter(Predicate::eq("author.name", named("author")));
        let mut params = HashMap::new();
        params.insert("author".to_string(), Value::from("tim"));
        let bound = query.bind_named(&params).unwrap();
        assert_eq!(select(&bound), vec![2]);
    }

    #[test]
    fn test_null_handling_and_composition() {
        let bound = Query::filter(Predicate::is_null("views"))
            .bind_positional(&[])
            .unwrap();
        assert_eq!(select(&bound), vec![3]);

        // comparisons against NULL never match
        let bound = Query::filter(Predicate::gt("views", literal(5)))
            .bind_positional(&[])
            .unwrap();
        assert_eq!(select(&bound), vec![1, 2]);

        let bound = Query::filter(
            Predicate::lt("views", literal(20)).or(Predicate::is_null("author")),
        )
        .order_by_desc("id")
        .bind_positional(&[])
        .unwrap();
        assert_eq!(select(&bound), vec![3, 1]);
    }

    #[test]
    fn test_range_ignores_negative_values() {
        let items = vec![1, 2, 3, 4, 5];
        assert_eq!(QueryRange::new(1, 2).apply(items.clone()), vec![2, 3]);
        assert_eq!(QueryRange::new(-1, 2).apply(items.clone()), vec![1, 2]);
        assert_eq!(QueryRange::new(3, -1).apply(items.clone()), vec![4, 5]);
        assert_eq!(QueryRange::new(-1, -1), QueryRange::all());
        assert_eq!(QueryRange::new(-1, -1).apply(items), vec![1, 2, 3, 4, 5]);
    }
}
