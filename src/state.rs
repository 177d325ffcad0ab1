//! Shared application state.

use std::sync::Arc;

use thiserror::Error;

use crate::config::Config;
use crate::remote::{PistonClient, RemoteError, RemoteExecutor};
use crate::review::{GroqReviewService, ReviewError, ReviewService};

/// A collaborator client could not be built.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("remote executor: {0}")]
    Remote(#[from] RemoteError),
    #[error("review service: {0}")]
    Review(#[from] ReviewError),
}

/// Read-only handles given to every handler. Sessions share nothing mutable.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub review: Arc<dyn ReviewService>,
    pub remote: Arc<dyn RemoteExecutor>,
}

impl AppState {
    /// Build the production collaborators from `config`.
    pub fn new(config: Config) -> Result<Self, StateError> {
        let remote = PistonClient::new(&config)?;
        let review = GroqReviewService::new(config.review.clone())?;
        Ok(Self::with_collaborators(config, Arc::new(review), Arc::new(remote)))
    }

    pub fn with_collaborators(
        config: Config,
        review: Arc<dyn ReviewService>,
        remote: Arc<dyn RemoteExecutor>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            review,
            remote,
        }
    }
}
