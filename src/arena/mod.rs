// Global side-table storage for instrumentation metadata
//
// Holders are never modified to carry their subscriber set or their
// "instrumented" flag. The holder arena maps the identity of a shared
// holder to the store created for it.

pub mod holder_arena;

pub use holder_arena::{HolderKey, is_instrumented};
pub(crate) use holder_arena::{get_or_insert_with, lookup, release};
