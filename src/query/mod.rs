mod builder;
mod constraint;
mod descriptor;

pub use builder::QueryBuilder;
pub use constraint::{Constraint, CursorKind, FilterOperator, OrderDirection};
pub use descriptor::{CursorBound, QueryDescriptor};
