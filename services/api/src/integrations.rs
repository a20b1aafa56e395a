//! Builds tool service handles from stored credentials.

use crate::db::CredentialStore;
use async_trait::async_trait;
use chrono::Utc;
use companion_core::tools::http::HttpGateway;
use companion_core::tools::services::ServiceError;
use companion_core::tools::{Integration, ToolHandle, ToolServiceFactory};
use std::sync::Arc;
use tracing::debug;

pub struct CredentialBackedFactory {
    store: Arc<dyn CredentialStore>,
    gateway: HttpGateway,
}

impl CredentialBackedFactory {
    pub fn new(store: Arc<dyn CredentialStore>, gateway: HttpGateway) -> Self {
        Self { store, gateway }
    }
}

#[async_trait]
impl ToolServiceFactory for CredentialBackedFactory {
    async fn connect(
        &self,
        user_id: &str,
        integration: Integration,
    ) -> Result<Option<ToolHandle>, ServiceError> {
        let credential = self
            .store
            .credential(user_id, integration)
            .await
            .map_err(|e| ServiceError::Upstream(format!("I couldn't load your {integration} settings ({e})")))?;

        match credential {
            None => Ok(None),
            Some(credential) if credential.is_expired(Utc::now()) => {
                debug!(%integration, "Stored credential has expired");
                Err(ServiceError::Unauthorized(integration.as_str().replace('_', " ")))
            }
            Some(credential) => Ok(Some(self.gateway.handle(integration, credential.access_token))),
        }
    }
}
