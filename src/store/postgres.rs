//! PostgreSQL ledger store.
//!
//! Enable with the `postgres` feature flag. Per-tenant serialization comes
//! from `SELECT ... FOR UPDATE` on the tenant row taken at the start of every
//! ledger transaction; grant rows are locked the same way before a debit.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

use super::persistence::{LedgerStore, LedgerTransaction};
use super::{StorageResultExt, StoreError, StoreResult};
use crate::types::{
    CreditGrant, GrantId, GrantType, Tenant, TenantId, Tier, UsageEvent, UsageEventId, UsageType,
};

const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";

#[derive(Clone, Debug)]
pub struct PgPoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Option<Duration>,
}

impl Default for PgPoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Some(Duration::from_secs(600)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PostgresConfig {
    pub database_url: SecretString,
    pub table_prefix: String,
    pub pool: PgPoolConfig,
}

impl PostgresConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: SecretString::from(database_url.into()),
            table_prefix: "ledger_".to_string(),
            pool: PgPoolConfig::default(),
        }
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> StoreResult<Self> {
        let prefix = prefix.into();
        if !prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(StoreError::Storage {
                message: format!(
                    "Invalid table prefix '{}': only ASCII alphanumeric and underscore allowed",
                    prefix
                ),
            });
        }
        self.table_prefix = prefix;
        Ok(self)
    }

    pub fn pool(mut self, pool: PgPoolConfig) -> Self {
        self.pool = pool;
        self
    }
}

#[derive(Debug)]
struct Tables {
    tenants: String,
    grants: String,
    usage: String,
}

impl Tables {
    fn new(prefix: &str) -> Self {
        Self {
            tenants: format!("{}tenants", prefix),
            grants: format!("{}credit_grants", prefix),
            usage: format!("{}usage_events", prefix),
        }
    }
}

fn map_sqlx(error: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &error
        && let Some(code) = db.code()
        && matches!(code.as_ref(), SERIALIZATION_FAILURE | DEADLOCK_DETECTED)
    {
        return StoreError::Conflict {
            message: db.message().to_string(),
        };
    }
    StoreError::Storage {
        message: error.to_string(),
    }
}

fn to_i64(value: u64, what: &str) -> StoreResult<i64> {
    i64::try_from(value).map_err(|_| StoreError::Corrupt {
        message: format!("{} {} exceeds BIGINT range", what, value),
    })
}

fn to_u64(value: i64, what: &str) -> StoreResult<u64> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt {
        message: format!("negative {} {}", what, value),
    })
}

fn tenant_from_row(row: &PgRow) -> StoreResult<Tenant> {
    let id: String = row.try_get("id").storage_err()?;
    let tier: String = row.try_get("tier").storage_err()?;
    let tier = Tier::parse(&tier).ok_or_else(|| StoreError::Corrupt {
        message: format!("unknown tier '{}' for tenant {}", tier, id),
    })?;
    Ok(Tenant {
        id: TenantId(id),
        tier,
        created_at: row.try_get("created_at").storage_err()?,
    })
}

fn grant_from_row(row: &PgRow) -> StoreResult<CreditGrant> {
    let grant_type: String = row.try_get("grant_type").storage_err()?;
    let grant_type = GrantType::parse(&grant_type).ok_or_else(|| StoreError::Corrupt {
        message: format!("unknown grant type '{}'", grant_type),
    })?;
    Ok(CreditGrant {
        id: GrantId(row.try_get::<Uuid, _>("id").storage_err()?),
        tenant_id: TenantId(row.try_get("tenant_id").storage_err()?),
        remaining: to_u64(row.try_get("remaining").storage_err()?, "remaining")?,
        grant_type,
        expires_at: row.try_get("expires_at").storage_err()?,
        created_at: row.try_get("created_at").storage_err()?,
    })
}

fn usage_from_row(row: &PgRow) -> StoreResult<UsageEvent> {
    let usage_type: String = row.try_get("usage_type").storage_err()?;
    let usage_type = UsageType::parse(&usage_type).ok_or_else(|| StoreError::Corrupt {
        message: format!("unknown usage type '{}'", usage_type),
    })?;
    Ok(UsageEvent {
        id: UsageEventId(row.try_get::<Uuid, _>("id").storage_err()?),
        tenant_id: TenantId(row.try_get("tenant_id").storage_err()?),
        usage_type,
        amount: to_u64(row.try_get("amount").storage_err()?, "amount")?,
        notebook_id: row.try_get("notebook_id").storage_err()?,
        created_at: row.try_get("created_at").storage_err()?,
    })
}

fn insert_grant_sql(tables: &Tables) -> String {
    format!(
        r#"
        INSERT INTO {} (id, tenant_id, remaining, grant_type, expires_at, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
        tables.grants
    )
}

fn bind_grant<'q>(
    query: sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>,
    grant: &'q CreditGrant,
) -> StoreResult<sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>> {
    Ok(query
        .bind(grant.id.0)
        .bind(grant.tenant_id.as_str())
        .bind(to_i64(grant.remaining, "remaining")?)
        .bind(grant.grant_type.as_str())
        .bind(grant.expires_at)
        .bind(grant.created_at))
}

fn grant_insert_err(error: sqlx::Error, grant: &CreditGrant) -> StoreError {
    match &error {
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => StoreError::TenantNotFound {
            id: grant.tenant_id.to_string(),
        },
        _ => map_sqlx(error),
    }
}

/// PostgreSQL ledger store.
pub struct PostgresLedgerStore {
    pool: Arc<PgPool>,
    tables: Arc<Tables>,
}

impl PostgresLedgerStore {
    pub async fn connect(config: PostgresConfig) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool.max_connections)
            .min_connections(config.pool.min_connections)
            .acquire_timeout(config.pool.acquire_timeout)
            .idle_timeout(config.pool.idle_timeout)
            .connect(config.database_url.expose_secret())
            .await
            .storage_err_ctx("connect")?;
        Ok(Self::with_pool(Arc::new(pool), &config.table_prefix))
    }

    /// Create with an existing connection pool.
    pub fn with_pool(pool: Arc<PgPool>, table_prefix: &str) -> Self {
        Self {
            pool,
            tables: Arc::new(Tables::new(table_prefix)),
        }
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        let Tables {
            tenants,
            grants,
            usage,
        } = &*self.tables;
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {tenants} (
                id VARCHAR(255) PRIMARY KEY,
                tier VARCHAR(32) NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            CREATE TABLE IF NOT EXISTS {grants} (
                id UUID PRIMARY KEY,
                tenant_id VARCHAR(255) NOT NULL REFERENCES {tenants} (id),
                remaining BIGINT NOT NULL CHECK (remaining >= 0),
                grant_type VARCHAR(32) NOT NULL,
                expires_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            CREATE INDEX IF NOT EXISTS idx_{grants}_tenant ON {grants} (tenant_id);
            CREATE TABLE IF NOT EXISTS {usage} (
                id UUID PRIMARY KEY,
                tenant_id VARCHAR(255) NOT NULL REFERENCES {tenants} (id),
                usage_type VARCHAR(32) NOT NULL,
                amount BIGINT NOT NULL CHECK (amount > 0),
                notebook_id VARCHAR(255),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            CREATE INDEX IF NOT EXISTS idx_{usage}_tenant_type_time
                ON {usage} (tenant_id, usage_type, created_at);
            "#
        );
        sqlx::raw_sql(&ddl)
            .execute(&*self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn insert_tenant(&self, tenant: &Tenant) -> StoreResult<bool> {
        let query = format!(
            "INSERT INTO {} (id, tier, created_at) VALUES ($1, $2, $3) ON CONFLICT (id) DO NOTHING",
            self.tables.tenants
        );
        let result = sqlx::query(&query)
            .bind(tenant.id.as_str())
            .bind(tenant.tier.as_str())
            .bind(tenant.created_at)
            .execute(&*self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn load_tenant(&self, id: &TenantId) -> StoreResult<Option<Tenant>> {
        let query = format!(
            "SELECT id, tier, created_at FROM {} WHERE id = $1",
            self.tables.tenants
        );
        let row = sqlx::query(&query)
            .bind(id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(tenant_from_row).transpose()
    }

    async fn insert_grant(&self, grant: &CreditGrant) -> StoreResult<()> {
        let query = insert_grant_sql(&self.tables);
        bind_grant(sqlx::query(&query), grant)?
            .execute(&*self.pool)
            .await
            .map_err(|e| grant_insert_err(e, grant))?;
        Ok(())
    }

    async fn list_grants(&self, tenant_id: &TenantId) -> StoreResult<Vec<CreditGrant>> {
        let query = format!(
            r#"
            SELECT id, tenant_id, remaining, grant_type, expires_at, created_at
            FROM {} WHERE tenant_id = $1 ORDER BY created_at
            "#,
            self.tables.grants
        );
        let rows = sqlx::query(&query)
            .bind(tenant_id.as_str())
            .fetch_all(&*self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter().map(grant_from_row).collect()
    }

    async fn list_usage(
        &self,
        tenant_id: &TenantId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<UsageEvent>> {
        let query = format!(
            r#"
            SELECT id, tenant_id, usage_type, amount, notebook_id, created_at
            FROM {}
            WHERE tenant_id = $1 AND created_at >= $2 AND created_at < $3
            ORDER BY created_at
            "#,
            self.tables.usage
        );
        let rows = sqlx::query(&query)
            .bind(tenant_id.as_str())
            .bind(start)
            .bind(end)
            .fetch_all(&*self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter().map(usage_from_row).collect()
    }

    async fn purge_usage_before(
        &self,
        tenant_id: &TenantId,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let query = format!(
            "DELETE FROM {} WHERE tenant_id = $1 AND created_at < $2",
            self.tables.usage
        );
        let result = sqlx::query(&query)
            .bind(tenant_id.as_str())
            .bind(cutoff)
            .execute(&*self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(result.rows_affected())
    }

    async fn begin(&self, tenant_id: &TenantId) -> StoreResult<Box<dyn LedgerTransaction>> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        let query = format!(
            "SELECT id, tier, created_at FROM {} WHERE id = $1 FOR UPDATE",
            self.tables.tenants
        );
        let row = sqlx::query(&query)
            .bind(tenant_id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx)?;

        let Some(row) = row else {
            if let Err(e) = tx.rollback().await {
                tracing::debug!(error = %e, "Rollback after missing tenant failed");
            }
            return Err(StoreError::TenantNotFound {
                id: tenant_id.to_string(),
            });
        };

        Ok(Box::new(PostgresTransaction {
            tenant: tenant_from_row(&row)?,
            tx,
            tables: Arc::clone(&self.tables),
        }))
    }
}

struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
    tenant: Tenant,
    tables: Arc<Tables>,
}

#[async_trait]
impl LedgerTransaction for PostgresTransaction {
    fn tenant(&self) -> &Tenant {
        &self.tenant
    }

    async fn usage_between(
        &mut self,
        usage_type: UsageType,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let query = format!(
            r#"
            SELECT COALESCE(SUM(amount), 0)::BIGINT AS total
            FROM {}
            WHERE tenant_id = $1 AND usage_type = $2 AND created_at >= $3 AND created_at < $4
            "#,
            self.tables.usage
        );
        let row = sqlx::query(&query)
            .bind(self.tenant.id.as_str())
            .bind(usage_type.as_str())
            .bind(start)
            .bind(end)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        to_u64(row.try_get("total").storage_err()?, "total")
    }

    async fn usage_by_type(
        &mut self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<HashMap<UsageType, u64>> {
        let query = format!(
            r#"
            SELECT usage_type, COALESCE(SUM(amount), 0)::BIGINT AS total
            FROM {}
            WHERE tenant_id = $1 AND created_at >= $2 AND created_at < $3
            GROUP BY usage_type
            "#,
            self.tables.usage
        );
        let rows = sqlx::query(&query)
            .bind(self.tenant.id.as_str())
            .bind(start)
            .bind(end)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;

        let mut totals = HashMap::new();
        for row in &rows {
            let name: String = row.try_get("usage_type").storage_err()?;
            let Some(usage_type) = UsageType::parse(&name) else {
                return Err(StoreError::Corrupt {
                    message: format!("unknown usage type '{}'", name),
                });
            };
            totals.insert(usage_type, to_u64(row.try_get("total").storage_err()?, "total")?);
        }
        Ok(totals)
    }

    async fn grants_for_update(&mut self) -> StoreResult<Vec<CreditGrant>> {
        let query = format!(
            r#"
            SELECT id, tenant_id, remaining, grant_type, expires_at, created_at
            FROM {} WHERE tenant_id = $1 ORDER BY created_at
            FOR UPDATE
            "#,
            self.tables.grants
        );
        let rows = sqlx::query(&query)
            .bind(self.tenant.id.as_str())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        rows.iter().map(grant_from_row).collect()
    }

    async fn append_usage(&mut self, event: &UsageEvent) -> StoreResult<()> {
        let query = format!(
            r#"
            INSERT INTO {} (id, tenant_id, usage_type, amount, notebook_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
            self.tables.usage
        );
        sqlx::query(&query)
            .bind(event.id.0)
            .bind(event.tenant_id.as_str())
            .bind(event.usage_type.as_str())
            .bind(to_i64(event.amount, "amount")?)
            .bind(event.notebook_id.as_deref())
            .bind(event.created_at)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn add_grant(&mut self, grant: &CreditGrant) -> StoreResult<()> {
        if grant.tenant_id != self.tenant.id {
            return Err(StoreError::Storage {
                message: format!(
                    "grant for tenant {} written in transaction of {}",
                    grant.tenant_id, self.tenant.id
                ),
            });
        }
        let query = insert_grant_sql(&self.tables);
        bind_grant(sqlx::query(&query), grant)?
            .execute(&mut *self.tx)
            .await
            .map_err(|e| grant_insert_err(e, grant))?;
        Ok(())
    }

    async fn deduct(&mut self, grant_id: GrantId, amount: u64) -> StoreResult<u64> {
        let query = format!(
            r#"
            UPDATE {} SET remaining = remaining - $1
            WHERE id = $2 AND tenant_id = $3 AND remaining >= $1
            RETURNING remaining
            "#,
            self.tables.grants
        );
        let row = sqlx::query(&query)
            .bind(to_i64(amount, "amount")?)
            .bind(grant_id.0)
            .bind(self.tenant.id.as_str())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        if let Some(row) = row {
            return to_u64(row.try_get("remaining").storage_err()?, "remaining");
        }

        let query = format!(
            "SELECT remaining FROM {} WHERE id = $1 AND tenant_id = $2",
            self.tables.grants
        );
        let row = sqlx::query(&query)
            .bind(grant_id.0)
            .bind(self.tenant.id.as_str())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        match row {
            Some(row) => Err(StoreError::Overdrawn {
                requested: amount,
                available: to_u64(row.try_get("remaining").storage_err()?, "remaining")?,
            }),
            None => Err(StoreError::GrantNotFound {
                id: grant_id.to_string(),
            }),
        }
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await.map_err(map_sqlx)
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.tx.rollback().await.map_err(map_sqlx)
    }
}
