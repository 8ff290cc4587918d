// Test utilities: in-memory node and storage plus deterministic bundles

pub mod fixtures;
pub mod memory_storage;
pub mod mock_node;

pub use memory_storage::{GraphSnapshot, MemoryStorage};
pub use mock_node::MockNode;
