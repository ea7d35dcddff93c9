//! Storage traits and implementations
//!
//! [`MirrorStore`] is the only persistence seam the sync engines see. The
//! in-memory store backs tests; the SQLite store is the durable one.

mod memory;
mod sqlite;
mod traits;

pub use memory::InMemoryMirrorStore;
pub use sqlite::SqliteMirrorStore;
pub use traits::{DetailOrder, MirrorStore};

/// Error message recorded on a run retired by a newer one
pub const SUPERSEDED_MESSAGE: &str = "superseded by a newer run";
