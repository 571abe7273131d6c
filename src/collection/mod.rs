mod handle;
mod options;
mod process;
mod state;

pub use handle::CollectionHandle;
pub use options::{CacheKeyFn, CollectionOptions, FilterFn, SortFn, TransformFn};
pub use state::{ChangeSet, ChangeType, DocumentChange, DocumentRecord, SubscriptionPhase};
