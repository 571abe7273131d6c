use serde_json::Value;

use super::constraint::{Constraint, CursorKind, FilterOperator, OrderDirection};

/// Fluent accumulator for an ordered constraint list.
///
/// The builder is purely syntactic: it appends constraints in call order and
/// performs no validation of field conflicts or redundant orderings. The
/// backend decides semantic validity.
#[derive(Clone, Debug, Default)]
pub struct QueryBuilder {
    constraints: Vec<Constraint>,
}

impl QueryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn where_field(
        mut self,
        field: impl Into<String>,
        op: FilterOperator,
        value: impl Into<Value>,
    ) -> Self {
        self.constraints
            .push(Constraint::where_field(field, op, value));
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: OrderDirection) -> Self {
        self.constraints.push(Constraint::order_by(field, direction));
        self
    }

    pub fn limit(mut self, count: u32) -> Self {
        self.constraints.push(Constraint::limit(count));
        self
    }

    pub fn start_at(mut self, values: Vec<Value>) -> Self {
        self.constraints
            .push(Constraint::cursor(CursorKind::StartAt, values));
        self
    }

    pub fn start_after(mut self, values: Vec<Value>) -> Self {
        self.constraints
            .push(Constraint::cursor(CursorKind::StartAfter, values));
        self
    }

    pub fn end_at(mut self, values: Vec<Value>) -> Self {
        self.constraints
            .push(Constraint::cursor(CursorKind::EndAt, values));
        self
    }

    pub fn end_before(mut self, values: Vec<Value>) -> Self {
        self.constraints
            .push(Constraint::cursor(CursorKind::EndBefore, values));
        self
    }

    pub fn len(&self) -> usize {
        self.constraints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    /// Snapshots the constraint list at call time.
    ///
    /// Safe to call repeatedly; later additions do not affect earlier
    /// snapshots.
    pub fn build(&self) -> Vec<Constraint> {
        self.constraints.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn preserves_call_order() {
        let constraints = QueryBuilder::new()
            .order_by("name", OrderDirection::Ascending)
            .where_field("active", FilterOperator::Equal, true)
            .limit(5)
            .build();
        assert!(matches!(constraints[0], Constraint::OrderBy { .. }));
        assert!(matches!(constraints[1], Constraint::Where { .. }));
        assert!(matches!(constraints[2], Constraint::Limit { count: 5 }));
    }

    #[test]
    fn build_snapshots_the_list() {
        let builder = QueryBuilder::new().where_field("a", FilterOperator::Equal, 1);
        let first = builder.build();
        let second = builder.limit(3).build();
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 2);
    }

    #[test]
    fn cursors_carry_their_values() {
        let constraints = QueryBuilder::new()
            .order_by("population", OrderDirection::Descending)
            .start_after(vec![json!(1000)])
            .build();
        match &constraints[1] {
            Constraint::Cursor { cursor, values } => {
                assert_eq!(*cursor, CursorKind::StartAfter);
                assert_eq!(values, &vec![json!(1000)]);
            }
            other => panic!("expected cursor constraint, found {other:?}"),
        }
    }
}
