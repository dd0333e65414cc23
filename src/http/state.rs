use crate::conversation::Dialogue;
use std::sync::Arc;

/// Shared application state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// The single conversation this process hosts
    pub dialogue: Arc<Dialogue>,
}

impl AppState {
    pub fn new(dialogue: Arc<Dialogue>) -> Self {
        Self { dialogue }
    }
}
