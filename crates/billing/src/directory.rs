//! Member directory
//!
//! Live member counts are owned by the membership side of the platform; the
//! billing engine only reads them to check tier eligibility.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

#[async_trait]
pub trait MemberDirectory: Send + Sync {
    /// Number of active members in a church
    async fn count_members(&self, tenant_id: Uuid) -> BillingResult<i64>;
}

/// Counts active members in the `members` table
#[derive(Clone)]
pub struct PgMemberDirectory {
    pool: PgPool,
}

impl PgMemberDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MemberDirectory for PgMemberDirectory {
    async fn count_members(&self, tenant_id: Uuid) -> BillingResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM members WHERE church_id = $1 AND status = 'active'",
        )
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

/// Member counts held in memory. Unknown churches have no members.
#[derive(Debug, Default)]
pub struct InMemoryMemberDirectory {
    counts: Mutex<HashMap<Uuid, i64>>,
    unavailable: Mutex<HashSet<Uuid>>,
}

impl InMemoryMemberDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_count(&self, tenant_id: Uuid, count: i64) {
        self.counts.lock().await.insert(tenant_id, count);
    }

    /// Make lookups for `tenant_id` fail, as if the directory were down for it.
    pub async fn make_unavailable(&self, tenant_id: Uuid) {
        self.unavailable.lock().await.insert(tenant_id);
    }
}

#[async_trait]
impl MemberDirectory for InMemoryMemberDirectory {
    async fn count_members(&self, tenant_id: Uuid) -> BillingResult<i64> {
        if self.unavailable.lock().await.contains(&tenant_id) {
            return Err(BillingError::Internal(format!(
                "Member directory unavailable for church {}",
                tenant_id
            )));
        }
        Ok(self
            .counts
            .lock()
            .await
            .get(&tenant_id)
            .copied()
            .unwrap_or(0))
    }
}
