//! In-memory storage implementation.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

use super::traits::StateStorage;
use crate::error::Result;
use crate::state::State;

/// In-memory state storage for development and testing.
#[derive(Debug, Default)]
pub struct InMemoryStateStorage {
    state: Arc<RwLock<Option<State>>>,
    saves: AtomicU64,
}

impl InMemoryStateStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage pre-populated with `state`.
    pub fn with_state(state: State) -> Self {
        Self {
            state: Arc::new(RwLock::new(Some(state))),
            saves: AtomicU64::new(0),
        }
    }

    /// Number of completed saves.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StateStorage for InMemoryStateStorage {
    async fn load(&self) -> Result<Option<State>> {
        Ok(self.state.read().await.clone())
    }

    async fn save(&self, state: &State) -> Result<()> {
        *self.state.write().await = Some(state.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_and_load() {
        let storage = InMemoryStateStorage::new();
        assert!(storage.load().await.unwrap().is_none());
        assert_eq!(storage.load_or_default().await.unwrap(), State::default());

        let mut state = State::new();
        state.boot_done = true;
        storage.save(&state).await.unwrap();

        assert_eq!(storage.load().await.unwrap(), Some(state));
        assert_eq!(storage.save_count(), 1);
    }
}
