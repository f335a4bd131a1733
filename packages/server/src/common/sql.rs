//! Minimal persistence seam shared by all models.
//!
//! Models own their SQL: each implementation hand-writes its column lists so
//! schema drift is caught at review time rather than hidden behind a mapper.

use anyhow::Result;
use sqlx::PgPool;

/// CRUD seam implemented by row-backed models.
///
/// Append-only tables (audit entries) deliberately do not implement this
/// trait; they expose an insert function only.
#[async_trait::async_trait]
pub trait Record: Sized + Send {
    const TABLE: &'static str;
    type Id: Send;

    async fn find_by_id(id: Self::Id, db: &PgPool) -> Result<Self>;

    async fn insert(&self, db: &PgPool) -> Result<Self>;

    async fn update(&self, db: &PgPool) -> Result<Self>;
}
