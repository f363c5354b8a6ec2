//! Storage trait definition.

use async_trait::async_trait;

use crate::error::Result;
use crate::state::State;

/// Trait for provisioning state storage backends.
#[async_trait]
pub trait StateStorage: Send + Sync {
    /// Load the stored state, `None` if nothing was saved yet.
    async fn load(&self) -> Result<Option<State>>;

    /// Replace the stored state as a whole.
    async fn save(&self, state: &State) -> Result<()>;

    /// Load the stored state or start from an empty one.
    async fn load_or_default(&self) -> Result<State> {
        Ok(self.load().await?.unwrap_or_default())
    }
}
