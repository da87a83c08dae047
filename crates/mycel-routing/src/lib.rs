//! mycel-routing: topic addressing and handler lookup for the mycel fabric.
//!
//! Provides the `TopicPath` address algebra (network-scoped, segmented paths
//! with `*`, `>` and `{name}` segments) and the `PathTrie` handler index that
//! every publish, subscribe and request dispatch goes through.

pub mod error;
pub mod topic;
pub mod trie;

// Re-export commonly used items at crate root.
pub use error::{PathError, PathResult};
pub use topic::{PathSegment, SegmentKind, TopicPath};
pub use trie::{PathTrie, TrieMatch};
