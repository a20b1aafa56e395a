//! Per-session tool service handles.
//!
//! Handles are built on first need from the user's stored credentials and
//! cached for the lifetime of the session. Each integration sits behind its own
//! `OnceCell`, so concurrent callers share a single initialization.

use super::services::{
    CalendarService, EmailService, MusicService, ProductivityService, ServiceError, TaskService,
    WebSearchService,
};
use super::{Integration, ToolError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// A connected external collaborator.
#[derive(Clone)]
pub enum ToolHandle {
    Calendar(Arc<dyn CalendarService>),
    Tasks(Arc<dyn TaskService>),
    Music(Arc<dyn MusicService>),
    Email(Arc<dyn EmailService>),
    Productivity(Arc<dyn ProductivityService>),
    WebSearch(Arc<dyn WebSearchService>),
}

impl ToolHandle {
    pub fn integration(&self) -> Integration {
        match self {
            ToolHandle::Calendar(_) => Integration::Calendar,
            ToolHandle::Tasks(_) => Integration::Tasks,
            ToolHandle::Music(_) => Integration::Music,
            ToolHandle::Email(_) => Integration::Email,
            ToolHandle::Productivity(_) => Integration::Productivity,
            ToolHandle::WebSearch(_) => Integration::WebSearch,
        }
    }
}

/// Builds tool handles from stored per-user credentials.
#[async_trait]
pub trait ToolServiceFactory: Send + Sync {
    /// Returns `Ok(None)` when the user has not connected `integration`.
    async fn connect(
        &self,
        user_id: &str,
        integration: Integration,
    ) -> Result<Option<ToolHandle>, ServiceError>;
}

/// The lazily-initialized handle map owned by one session.
pub struct ToolServices {
    user_id: String,
    factory: Arc<dyn ToolServiceFactory>,
    cells: BTreeMap<Integration, OnceCell<ToolHandle>>,
}

macro_rules! handle_accessor {
    ($name:ident, $variant:ident, $service:ident) => {
        pub async fn $name(&self) -> Result<Arc<dyn $service>, ToolError> {
            match self.ensure(Integration::$variant).await? {
                ToolHandle::$variant(service) => Ok(service),
                other => Err(ToolError::Service(format!(
                    "expected a {} handle but the factory built {}",
                    Integration::$variant,
                    other.integration()
                ))),
            }
        }
    };
}

impl ToolServices {
    pub fn new(user_id: impl Into<String>, factory: Arc<dyn ToolServiceFactory>) -> Self {
        Self {
            user_id: user_id.into(),
            factory,
            cells: Integration::ALL
                .into_iter()
                .map(|integration| (integration, OnceCell::new()))
                .collect(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Returns the handle for `integration`, constructing it on first use.
    ///
    /// Failures are not cached; a later call retries the construction.
    pub async fn ensure(&self, integration: Integration) -> Result<ToolHandle, ToolError> {
        let cell = self
            .cells
            .get(&integration)
            .ok_or(ToolError::NotConnected(integration))?;
        let handle = cell
            .get_or_try_init(|| async {
                debug!(%integration, user_id = %self.user_id, "Initializing tool service");
                match self.factory.connect(&self.user_id, integration).await {
                    Ok(Some(handle)) if handle.integration() == integration => {
                        info!(%integration, "Tool service connected");
                        Ok(handle)
                    }
                    Ok(Some(handle)) => Err(ToolError::Service(format!(
                        "expected a {integration} handle but the factory built {}",
                        handle.integration()
                    ))),
                    Ok(None) => Err(ToolError::NotConnected(integration)),
                    Err(e) => {
                        warn!(%integration, error = %e, "Tool service initialization failed");
                        Err(ToolError::Service(e.to_string()))
                    }
                }
            })
            .await?;
        Ok(handle.clone())
    }

    /// Returns the handle only if it has already been initialized.
    pub fn get(&self, integration: Integration) -> Option<ToolHandle> {
        self.cells.get(&integration).and_then(|cell| cell.get().cloned())
    }

    /// Attempts to initialize every integration, returning those now available.
    pub async fn warm_up(&self) -> Vec<Integration> {
        for integration in Integration::ALL {
            if let Err(e) = self.ensure(integration).await {
                debug!(%integration, reason = %e, "Integration unavailable");
            }
        }
        self.initialized()
    }

    pub fn initialized(&self) -> Vec<Integration> {
        self.cells
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(integration, _)| *integration)
            .collect()
    }

    /// Drops every cached handle.
    pub fn release(&mut self) {
        for cell in self.cells.values_mut() {
            cell.take();
        }
    }

    handle_accessor!(calendar, Calendar, CalendarService);
    handle_accessor!(tasks, Tasks, TaskService);
    handle_accessor!(music, Music, MusicService);
    handle_accessor!(email, Email, EmailService);
    handle_accessor!(productivity, Productivity, ProductivityService);
    handle_accessor!(web_search, WebSearch, WebSearchService);
}
