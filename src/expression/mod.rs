pub mod pattern;
pub mod query;

pub use pattern::{contains_pattern, eval_like};

pub use query::{
    BoundQuery, CompareOp, Operand, OrderBy, Predicate, Query, QueryHints, QueryRange, literal,
    named, param,
};
