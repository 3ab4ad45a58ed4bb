mod provider_configs;
mod provisioning;
mod sessions;

use std::sync::Arc;

pub use provider_configs::ProviderConfigService;
pub use provisioning::ProvisioningService;
pub use sessions::{SessionError, SessionService};

use crate::{auth::ProviderFactory, db::DbPool};

/// Container for all services
#[derive(Clone)]
pub struct Services {
    pub provider_configs: ProviderConfigService,
    pub provisioning: ProvisioningService,
    pub sessions: SessionService,
}

impl Services {
    pub fn new(db: Arc<DbPool>, factory: ProviderFactory, session_ttl: std::time::Duration) -> Self {
        Self {
            provider_configs: ProviderConfigService::new(db.clone(), factory),
            provisioning: ProvisioningService::new(db.clone()),
            sessions: SessionService::new(db, session_ttl),
        }
    }
}
