//! State storage backends.
//!
//! Provides storage abstractions for persisting the provisioning state.

pub mod file;
pub mod memory;
pub mod traits;

pub use file::FileStateStorage;
pub use memory::InMemoryStateStorage;
pub use traits::StateStorage;
