use serde::Serialize;
use serde_json::Value;

/// Field comparison operators accepted by `Where` constraints.
///
/// The closed set mirrors the wire operators of the backing query language;
/// semantic validity of an operator/value pairing is the backend's concern.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum FilterOperator {
    #[serde(rename = "==")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = "<=")]
    LessThanOrEqual,
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = ">=")]
    GreaterThanOrEqual,
    #[serde(rename = "array-contains")]
    ArrayContains,
    #[serde(rename = "array-contains-any")]
    ArrayContainsAny,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not-in")]
    NotIn,
}

impl FilterOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::Equal => "==",
            FilterOperator::NotEqual => "!=",
            FilterOperator::LessThan => "<",
            FilterOperator::LessThanOrEqual => "<=",
            FilterOperator::GreaterThan => ">",
            FilterOperator::GreaterThanOrEqual => ">=",
            FilterOperator::ArrayContains => "array-contains",
            FilterOperator::ArrayContainsAny => "array-contains-any",
            FilterOperator::In => "in",
            FilterOperator::NotIn => "not-in",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum OrderDirection {
    #[default]
    #[serde(rename = "asc")]
    Ascending,
    #[serde(rename = "desc")]
    Descending,
}

impl OrderDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderDirection::Ascending => "asc",
            OrderDirection::Descending => "desc",
        }
    }
}

/// Which edge of the ordered result set a cursor pins, and whether the
/// matching position itself participates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CursorKind {
    #[serde(rename = "start-at")]
    StartAt,
    #[serde(rename = "start-after")]
    StartAfter,
    #[serde(rename = "end-at")]
    EndAt,
    #[serde(rename = "end-before")]
    EndBefore,
}

impl CursorKind {
    pub fn is_start(&self) -> bool {
        matches!(self, CursorKind::StartAt | CursorKind::StartAfter)
    }

    pub fn is_inclusive(&self) -> bool {
        matches!(self, CursorKind::StartAt | CursorKind::EndAt)
    }
}

/// One entry of a query's ordered constraint list.
///
/// Constraints are plain data. The list order is preserved everywhere it
/// matters: query semantics follow it, and the cache key serializes it
/// as-is, so two queries built with a different constraint order occupy
/// distinct cache slots.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Constraint {
    Where {
        field: String,
        op: FilterOperator,
        value: Value,
    },
    OrderBy {
        field: String,
        direction: OrderDirection,
    },
    Limit {
        count: u32,
    },
    Cursor {
        cursor: CursorKind,
        values: Vec<Value>,
    },
}

impl Constraint {
    pub fn where_field(
        field: impl Into<String>,
        op: FilterOperator,
        value: impl Into<Value>,
    ) -> Self {
        Constraint::Where {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn order_by(field: impl Into<String>, direction: OrderDirection) -> Self {
        Constraint::OrderBy {
            field: field.into(),
            direction,
        }
    }

    pub fn limit(count: u32) -> Self {
        Constraint::Limit { count }
    }

    pub fn cursor(cursor: CursorKind, values: Vec<Value>) -> Self {
        Constraint::Cursor { cursor, values }
    }
}
