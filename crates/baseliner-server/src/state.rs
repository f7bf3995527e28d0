use std::sync::Arc;

use control_plane::{InMemoryRateLimiter, RateLimiter, Settings, Store, TokenService};

use crate::error::AppError;

pub struct AppState {
    pub settings: Settings,
    pub store: Store,
    pub tokens: TokenService,
    pub limiter: Arc<dyn RateLimiter>,
}

impl AppState {
    pub fn from_settings(settings: Settings) -> Result<Self, AppError> {
        let store = Store::open(settings.sqlite_path())
            .map_err(|err| AppError::internal(err.to_string()))?;
        Ok(Self::with_store(settings, store))
    }

    pub fn with_store(settings: Settings, store: Store) -> Self {
        let tokens = TokenService::new(&settings.token_pepper);
        Self {
            settings,
            store,
            tokens,
            limiter: InMemoryRateLimiter::shared(),
        }
    }
}
