pub mod engine;
pub mod memory;
pub mod persistence;
pub mod state;

pub use engine::DurableStore;
pub use memory::MemoryStore;
pub use persistence::FileStore;
pub use state::TrackerState;
