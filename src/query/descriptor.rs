use std::sync::Arc;

use serde_json::Value;

use super::constraint::{Constraint, CursorKind, FilterOperator, OrderDirection};

/// An immutable query: a collection path plus an ordered constraint list.
///
/// Descriptors are cheap to clone and never mutated; adding a constraint
/// produces a new descriptor with a copied list.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryDescriptor {
    collection_path: String,
    constraints: Arc<Vec<Constraint>>,
}

/// A cursor bound resolved against a descriptor's constraint list.
#[derive(Clone, Copy, Debug)]
pub struct CursorBound<'a> {
    pub kind: CursorKind,
    pub values: &'a [Value],
}

impl CursorBound<'_> {
    pub fn is_inclusive(&self) -> bool {
        self.kind.is_inclusive()
    }
}

impl QueryDescriptor {
    pub fn new(collection_path: impl Into<String>, constraints: Vec<Constraint>) -> Self {
        Self {
            collection_path: collection_path.into(),
            constraints: Arc::new(constraints),
        }
    }

    pub fn collection_path(&self) -> &str {
        &self.collection_path
    }

    /// The raw constraint list, in the order it was built.
    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    /// Returns a new descriptor with `constraint` appended.
    pub fn with_constraint(&self, constraint: Constraint) -> Self {
        let mut constraints = self.constraints.as_ref().clone();
        constraints.push(constraint);
        Self {
            collection_path: self.collection_path.clone(),
            constraints: Arc::new(constraints),
        }
    }

    /// Deterministic cache key: the collection path plus the constraint list
    /// serialized in list order. Logically equivalent queries built in a
    /// different constraint order therefore key to different slots.
    pub fn cache_key(&self) -> String {
        let constraints = serde_json::to_string(self.constraints.as_ref())
            .expect("constraint lists always serialize");
        format!("{}|{}", self.collection_path, constraints)
    }

    /// All `Where` constraints, in list order.
    pub fn filters(&self) -> impl Iterator<Item = (&str, FilterOperator, &Value)> {
        self.constraints.iter().filter_map(|c| match c {
            Constraint::Where { field, op, value } => Some((field.as_str(), *op, value)),
            _ => None,
        })
    }

    /// All `OrderBy` constraints, in list order. Earlier entries are more
    /// significant sort keys.
    pub fn orderings(&self) -> Vec<(&str, OrderDirection)> {
        self.constraints
            .iter()
            .filter_map(|c| match c {
                Constraint::OrderBy { field, direction } => {
                    Some((field.as_str(), *direction))
                }
                _ => None,
            })
            .collect()
    }

    /// The effective result-size limit; the last `Limit` constraint wins.
    pub fn limit(&self) -> Option<u32> {
        self.constraints.iter().rev().find_map(|c| match c {
            Constraint::Limit { count } => Some(*count),
            _ => None,
        })
    }

    /// The effective start cursor; the last start-edge cursor wins.
    pub fn start_bound(&self) -> Option<CursorBound<'_>> {
        self.bound(true)
    }

    /// The effective end cursor; the last end-edge cursor wins.
    pub fn end_bound(&self) -> Option<CursorBound<'_>> {
        self.bound(false)
    }

    fn bound(&self, start: bool) -> Option<CursorBound<'_>> {
        self.constraints.iter().rev().find_map(|c| match c {
            Constraint::Cursor { cursor, values } if cursor.is_start() == start => {
                Some(CursorBound {
                    kind: *cursor,
                    values,
                })
            }
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryBuilder;
    use serde_json::json;

    #[test]
    fn cache_key_is_stable_for_identical_constraint_sequences() {
        let build = || {
            QueryDescriptor::new(
                "users",
                QueryBuilder::new()
                    .where_field("active", FilterOperator::Equal, true)
                    .order_by("name", OrderDirection::Ascending)
                    .build(),
            )
        };
        assert_eq!(build().cache_key(), build().cache_key());
    }

    #[test]
    fn cache_key_distinguishes_constraint_order() {
        let a = QueryDescriptor::new(
            "users",
            QueryBuilder::new()
                .where_field("active", FilterOperator::Equal, true)
                .limit(10)
                .build(),
        );
        let b = QueryDescriptor::new(
            "users",
            QueryBuilder::new()
                .limit(10)
                .where_field("active", FilterOperator::Equal, true)
                .build(),
        );
        assert_ne!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn with_constraint_leaves_the_original_untouched() {
        let base = QueryDescriptor::new("users", Vec::new());
        let extended = base.with_constraint(Constraint::limit(3));
        assert!(base.constraints().is_empty());
        assert_eq!(extended.constraints().len(), 1);
    }

    #[test]
    fn last_limit_and_cursor_win() {
        let descriptor = QueryDescriptor::new(
            "users",
            QueryBuilder::new()
                .limit(10)
                .order_by("age", OrderDirection::Ascending)
                .start_at(vec![json!(18)])
                .limit(5)
                .start_after(vec![json!(21)])
                .build(),
        );
        assert_eq!(descriptor.limit(), Some(5));
        let start = descriptor.start_bound().unwrap();
        assert_eq!(start.kind, CursorKind::StartAfter);
        assert_eq!(start.values, &[json!(21)]);
        assert!(descriptor.end_bound().is_none());
    }
}
