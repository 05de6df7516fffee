//! Persistence layer — storage adapter seam plus VectorClock-guarded sessions.

pub mod memory;
pub mod session;
pub mod traits;

pub use memory::MemoryStore;
pub use session::{ConflictRecord, MergeOutcome, SessionState, SessionStore};
pub use traits::StateStore;
