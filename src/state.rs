//! Shared application state.

use crate::pool::Pool;
use crate::sandbox::SandboxClient;

/// State handed to every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub client: SandboxClient,
}

impl AppState {
    pub fn new(pool: Pool) -> Self {
        let client = pool.sandboxes().client().clone();
        Self { pool, client }
    }
}
