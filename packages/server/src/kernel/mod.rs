// Kernel - core infrastructure with dependency injection
//
// ServerDeps holds all server dependencies (database, gateway, vault,
// queue, stream hub) and is shared by routes, job handlers, and the
// scheduler.
//
// IMPORTANT: Kernel is for INFRASTRUCTURE only, not business logic.
// Business logic belongs in domain layers and job handlers.

pub mod approvals;
pub mod audit;
pub mod budgets;
pub mod error;
pub mod gateway;
pub mod jobs;
pub mod reconcile;
pub mod scheduled_tasks;
pub mod stream_hub;
pub mod vault;
pub mod webhooks;

use std::sync::Arc;

use sqlx::PgPool;

use crate::config::Config;
use gateway::PlatformGateway;
use jobs::{JobQueue, PostgresJobQueue};
use vault::{CredentialVault, StaticVault};

pub use error::OrchestratorError;
pub use stream_hub::{ChangeEvent, StreamHub};

/// Shared dependency container. Built once at startup; cheap to clone via
/// Arc everywhere else.
pub struct ServerDeps {
    pub db_pool: PgPool,
    pub stream_hub: StreamHub,
    pub gateway: PlatformGateway,
    pub vault: Arc<dyn CredentialVault>,
    pub job_queue: Arc<dyn JobQueue>,
    pub config: Config,
}

impl ServerDeps {
    pub fn new(db_pool: PgPool, config: &Config) -> anyhow::Result<Arc<Self>> {
        Self::with_vault(db_pool, config, Arc::new(StaticVault))
    }

    /// Build with a specific vault implementation (the key-service client in
    /// production, `StaticVault` in development and tests).
    pub fn with_vault(
        db_pool: PgPool,
        config: &Config,
        vault: Arc<dyn CredentialVault>,
    ) -> anyhow::Result<Arc<Self>> {
        let gateway =
            PlatformGateway::new(db_pool.clone(), vault.clone(), config.gateway_timeout)?;
        let job_queue: Arc<dyn JobQueue> = Arc::new(PostgresJobQueue::new(db_pool.clone()));

        Ok(Arc::new(Self {
            db_pool,
            stream_hub: StreamHub::new(),
            gateway,
            vault,
            job_queue,
            config: config.clone(),
        }))
    }
}
