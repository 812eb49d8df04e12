//! Provider Registry: the active (LLM, image) pair.
//!
//! The pair is swapped as a whole behind one lock, so a reader either sees
//! the old pair or the new one. Dispatch takes a [`ProviderRegistry::snapshot`]
//! once and uses it for the whole task.

use std::sync::{Arc, RwLock};

use crate::llm::{ImageProvider, LlmProvider};

/// One consistent set of backends.
#[derive(Clone)]
pub struct ProviderPair {
    pub llm: Arc<dyn LlmProvider>,
    pub image: Arc<dyn ImageProvider>,
}

impl ProviderPair {
    pub fn new(llm: Arc<dyn LlmProvider>, image: Arc<dyn ImageProvider>) -> Self {
        Self { llm, image }
    }
}

impl std::fmt::Debug for ProviderPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderPair")
            .field("llm", &self.llm.name())
            .field("image", &self.image.name())
            .finish()
    }
}

pub struct ProviderRegistry {
    current: RwLock<Arc<ProviderPair>>,
}

impl ProviderRegistry {
    pub fn new(pair: ProviderPair) -> Self {
        Self {
            current: RwLock::new(Arc::new(pair)),
        }
    }

    /// The pair active right now. Later swaps do not affect it.
    pub fn snapshot(&self) -> Arc<ProviderPair> {
        // A poisoned lock still holds a complete pair.
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Replace both providers at once.
    pub fn replace(&self, pair: ProviderPair) {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(pair);
    }
}
