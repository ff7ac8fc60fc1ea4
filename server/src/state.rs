use std::sync::Arc;

use crate::config::Config;
use crate::db::Database;
use crate::rate_limit::RateLimiter;

#[derive(Clone)]
pub struct AppState(pub Arc<Inner>);

pub struct Inner {
    pub db: Database,
    pub rate_limiter: RateLimiter,
    pub config: Config,
}

impl AppState {
    pub fn new(db: Database, config: Config) -> Self {
        let rate_limiter = RateLimiter::new(config.rate_limit_window_secs, config.rate_limit_max_requests);
        AppState(Arc::new(Inner { db, rate_limiter, config }))
    }
}

impl std::ops::Deref for AppState {
    type Target = Inner;
    fn deref(&self) -> &Inner {
        &self.0
    }
}
