use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use sqlx::PgPool;
use std::collections::HashMap;
use uuid::Uuid;

use crate::models::preparation::{PreparationRecord, PreparationStatus};

#[async_trait]
pub trait PreparationRepository: Send + Sync {
    async fn insert(&self, record: &PreparationRecord) -> anyhow::Result<()>;

    /// All records, or only those in `status`, ordered by event date.
    async fn list(&self, status: Option<PreparationStatus>) -> anyhow::Result<Vec<PreparationRecord>>;

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<PreparationRecord>>;

    /// Moves the record to `to` only if it is currently in one of `from`.
    /// Returns whether a row changed. Entering `archived` stamps `archived_at`.
    async fn transition(
        &self,
        id: Uuid,
        from: &[PreparationStatus],
        to: PreparationStatus,
        at: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    /// Returns false when the asset is unknown.
    async fn set_asset_defect(&self, asset_id: Uuid, defect: bool) -> anyhow::Result<bool>;

    async fn asset_defect(&self, asset_id: Uuid) -> anyhow::Result<Option<bool>>;
}

pub struct PgPreparationRepository {
    pool: PgPool,
}

impl PgPreparationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct PreparationRow {
    id: Uuid,
    asset_id: Uuid,
    event_date: NaiveDate,
    status: String,
    archived_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PreparationRow> for PreparationRecord {
    type Error = anyhow::Error;

    fn try_from(row: PreparationRow) -> Result<Self, Self::Error> {
        Ok(PreparationRecord {
            id: row.id,
            asset_id: row.asset_id,
            event_date: row.event_date,
            status: row.status.parse().map_err(anyhow::Error::msg)?,
            archived_at: row.archived_at,
            updated_at: row.updated_at,
        })
    }
}

const SELECT_PREPARATION: &str =
    "SELECT id, asset_id, event_date, status, archived_at, updated_at FROM preparations";

#[async_trait]
impl PreparationRepository for PgPreparationRepository {
    async fn insert(&self, record: &PreparationRecord) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO assets (id, label) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING")
            .bind(record.asset_id)
            .bind(record.asset_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to register asset: {}", e))?;
        sqlx::query(
            "INSERT INTO preparations (id, asset_id, event_date, status, archived_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(record.id)
        .bind(record.asset_id)
        .bind(record.event_date)
        .bind(record.status.as_str())
        .bind(record.archived_at)
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to insert preparation: {}", e))?;
        tx.commit().await?;
        Ok(())
    }

    async fn list(&self, status: Option<PreparationStatus>) -> anyhow::Result<Vec<PreparationRecord>> {
        let rows = match status {
            Some(status) => {
                let sql = format!("{} WHERE status = $1 ORDER BY event_date, id", SELECT_PREPARATION);
                sqlx::query_as::<_, PreparationRow>(&sql)
                    .bind(status.as_str())
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                let sql = format!("{} ORDER BY event_date, id", SELECT_PREPARATION);
                sqlx::query_as::<_, PreparationRow>(&sql)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(|e| anyhow::anyhow!("Failed to list preparations: {}", e))?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<PreparationRecord>> {
        let row = sqlx::query_as::<_, PreparationRow>(&format!("{} WHERE id = $1", SELECT_PREPARATION))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to load preparation {}: {}", id, e))?;

        row.map(TryInto::try_into).transpose()
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[PreparationStatus],
        to: PreparationStatus,
        at: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let from: Vec<&str> = from.iter().map(|s| s.as_str()).collect();
        let archived_at = (to == PreparationStatus::Archived).then_some(at);

        let result = sqlx::query(
            "UPDATE preparations \
             SET status = $1, updated_at = $2, archived_at = COALESCE($3, archived_at) \
             WHERE id = $4 AND status = ANY($5)",
        )
        .bind(to.as_str())
        .bind(at)
        .bind(archived_at)
        .bind(id)
        .bind(&from)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to update preparation {}: {}", id, e))?;

        Ok(result.rows_affected() == 1)
    }

    async fn set_asset_defect(&self, asset_id: Uuid, defect: bool) -> anyhow::Result<bool> {
        let result = sqlx::query("UPDATE assets SET defect = $1 WHERE id = $2")
            .bind(defect)
            .bind(asset_id)
            .execute(&self.pool)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to flag asset {}: {}", asset_id, e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn asset_defect(&self, asset_id: Uuid) -> anyhow::Result<Option<bool>> {
        let defect: Option<(bool,)> = sqlx::query_as("SELECT defect FROM assets WHERE id = $1")
            .bind(asset_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to load asset {}: {}", asset_id, e))?;
        Ok(defect.map(|(d,)| d))
    }
}

/// In-memory store. The write lock makes every transition a compare-and-set.
#[derive(Default)]
pub struct MemoryPreparationRepository {
    records: RwLock<HashMap<Uuid, PreparationRecord>>,
    assets: RwLock<HashMap<Uuid, bool>>,
}

impl MemoryPreparationRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PreparationRepository for MemoryPreparationRepository {
    async fn insert(&self, record: &PreparationRecord) -> anyhow::Result<()> {
        let mut records = self.records.write();
        if records.contains_key(&record.id) {
            anyhow::bail!("preparation {} already exists", record.id);
        }
        self.assets.write().entry(record.asset_id).or_insert(false);
        records.insert(record.id, record.clone());
        Ok(())
    }

    async fn list(&self, status: Option<PreparationStatus>) -> anyhow::Result<Vec<PreparationRecord>> {
        let mut found: Vec<PreparationRecord> = self
            .records
            .read()
            .values()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect();
        found.sort_by_key(|r| (r.event_date, r.id));
        Ok(found)
    }

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<PreparationRecord>> {
        Ok(self.records.read().get(&id).cloned())
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[PreparationStatus],
        to: PreparationStatus,
        at: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let mut records = self.records.write();
        match records.get_mut(&id) {
            Some(record) if from.contains(&record.status) => {
                record.status = to;
                record.updated_at = at;
                if to == PreparationStatus::Archived {
                    record.archived_at = Some(at);
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_asset_defect(&self, asset_id: Uuid, defect: bool) -> anyhow::Result<bool> {
        match self.assets.write().get_mut(&asset_id) {
            Some(flag) => {
                *flag = defect;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn asset_defect(&self, asset_id: Uuid) -> anyhow::Result<Option<bool>> {
        Ok(self.assets.read().get(&asset_id).copied())
    }
}
