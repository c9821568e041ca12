use std::sync::Arc;

use vds::{InMemoryStorage, LocalService};

use crate::auth::AuthorizationOracle;

pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub service: LocalService<InMemoryStorage>,
    pub oracle: Arc<dyn AuthorizationOracle>,
}

impl AppState {
    pub fn new(service: LocalService<InMemoryStorage>, oracle: Arc<dyn AuthorizationOracle>) -> Self {
        Self { service, oracle }
    }
}
