//! C1: the durable state store. One `deployments` row per deployment
//! attempt, backed by SQLite, following the connection-setup and
//! migration-running conventions of `shuttle-gateway/src/dal.rs`.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::migrate::{MigrateDatabase, Migrator};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use sqlx::{query, query_as, Row, Sqlite as SqlxSqlite, SqlitePool};
use tracing::info;

use crate::error::{Error, ErrorKind};
use crate::model::{Deployment, DeploymentId, Slug, Status};

pub static MIGRATIONS: Migrator = sqlx::migrate!("./migrations");

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn insert(&self, deployment: &Deployment) -> Result<(), Error>;
    async fn get(&self, id: &DeploymentId) -> Result<Deployment, Error>;
    async fn list(&self) -> Result<Vec<Deployment>, Error>;
    async fn update_status(&self, id: &DeploymentId, status: Status) -> Result<(), Error>;
    async fn update_url(&self, id: &DeploymentId, url: &str) -> Result<(), Error>;
    async fn delete(&self, id: &DeploymentId) -> Result<(), Error>;
    async fn list_expired_live(&self) -> Result<Vec<Deployment>, Error>;
}

/// SQLite-backed implementation. A single writer at a time is enforced by
/// SQLite itself under WAL mode (readers do not block on the writer); this
/// satisfies spec §4.1's concurrency policy without an explicit mutex.
#[derive(Clone)]
pub struct Sqlite {
    pool: SqlitePool,
}

impl Sqlite {
    pub async fn new(path: &str) -> Result<Self, Error> {
        if !Path::new(path).exists() {
            SqlxSqlite::create_database(path)
                .await
                .map_err(|e| Error::source(ErrorKind::StoreError, e))?;
        }

        info!(path, "opening state store");

        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| Error::source(ErrorKind::StoreError, e))?
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(options)
            .await
            .map_err(|e| Error::source(ErrorKind::StoreError, e))?;

        MIGRATIONS
            .run(&pool)
            .await
            .map_err(|e| Error::source(ErrorKind::StoreError, e))?;

        Ok(Self { pool })
    }

    #[cfg(test)]
    pub async fn new_in_memory() -> Self {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        MIGRATIONS.run(&pool).await.unwrap();
        Self { pool }
    }
}

#[async_trait]
impl StateStore for Sqlite {
    async fn insert(&self, d: &Deployment) -> Result<(), Error> {
        // Fast-path check for the common case; the `slug` column's UNIQUE
        // constraint is what actually closes the race below.
        let existing: Option<String> = query("SELECT id FROM deployments WHERE slug = ?1")
            .bind(&d.slug.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::source(ErrorKind::StoreError, e))?
            .map(|row| row.get("id"));

        if existing.is_some() {
            return Err(crate::model::conflict(&d.slug));
        }

        let (repo_url, branch) = match &d.source {
            crate::model::SourceSpec::Zip => (None, None),
            crate::model::SourceSpec::Git { repo_url, branch } => {
                (Some(repo_url.clone()), Some(branch.clone()))
            }
        };

        query(
            r#"
            INSERT INTO deployments
                (id, slug, display_name, source_kind, repo_url, branch, build_command,
                 output_subdir, env_vars, status, url, webhook_secret, auto_deploy,
                 created_at, updated_at, expires_at)
            VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)
            "#,
        )
        .bind(&d.id.0)
        .bind(&d.slug.0)
        .bind(&d.display_name)
        .bind(d.source.kind_str())
        .bind(repo_url)
        .bind(branch)
        .bind(&d.build_command)
        .bind(&d.output_subdir)
        .bind(d.env_vars.to_json())
        .bind(d.status)
        .bind(&d.url)
        .bind(&d.webhook_secret)
        .bind(d.auto_deploy)
        .bind(d.created_at)
        .bind(d.updated_at)
        .bind(d.expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                crate::model::conflict(&d.slug)
            }
            _ => Error::source(ErrorKind::StoreError, e),
        })?;

        Ok(())
    }

    async fn get(&self, id: &DeploymentId) -> Result<Deployment, Error> {
        query_as("SELECT * FROM deployments WHERE id = ?1")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::source(ErrorKind::StoreError, e))?
            .ok_or_else(|| Error::kind(ErrorKind::NotFound))
    }

    async fn list(&self) -> Result<Vec<Deployment>, Error> {
        query_as("SELECT * FROM deployments ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::source(ErrorKind::StoreError, e))
    }

    async fn update_status(&self, id: &DeploymentId, status: Status) -> Result<(), Error> {
        let result = query("UPDATE deployments SET status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(status)
            .bind(Utc::now())
            .bind(&id.0)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::source(ErrorKind::StoreError, e))?;

        if result.rows_affected() == 0 {
            return Err(Error::kind(ErrorKind::NotFound));
        }
        Ok(())
    }

    async fn update_url(&self, id: &DeploymentId, url: &str) -> Result<(), Error> {
        let result = query("UPDATE deployments SET url = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(url)
            .bind(Utc::now())
            .bind(&id.0)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::source(ErrorKind::StoreError, e))?;

        if result.rows_affected() == 0 {
            return Err(Error::kind(ErrorKind::NotFound));
        }
        Ok(())
    }

    async fn delete(&self, id: &DeploymentId) -> Result<(), Error> {
        let result = query("DELETE FROM deployments WHERE id = ?1")
            .bind(&id.0)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::source(ErrorKind::StoreError, e))?;

        if result.rows_affected() == 0 {
            return Err(Error::kind(ErrorKind::NotFound));
        }
        Ok(())
    }

    async fn list_expired_live(&self) -> Result<Vec<Deployment>, Error> {
        query_as(
            r#"
            SELECT * FROM deployments
            WHERE expires_at IS NOT NULL
              AND expires_at <= ?1
              AND status = ?2
            "#,
        )
        .bind(Utc::now())
        .bind(Status::Live)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::source(ErrorKind::StoreError, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EnvVars, SourceSpec};
    use chrono::Duration;

    fn sample(slug: &str) -> Deployment {
        Deployment::new(
            Slug(slug.to_string()),
            "test site".to_string(),
            SourceSpec::Zip,
            String::new(),
            ".".to_string(),
            EnvVars::default(),
            false,
            "localhost",
            None,
        )
    }

    #[tokio::test]
    async fn insert_and_get_roundtrip() {
        let store = Sqlite::new_in_memory().await;
        let d = sample("brave-otter-ab12");
        store.insert(&d).await.unwrap();

        let fetched = store.get(&d.id).await.unwrap();
        assert_eq!(fetched.slug, d.slug);
        assert_eq!(fetched.status, Status::Deploying);
        assert_eq!(fetched.url, format!("http://{}.localhost", d.slug.0));
    }

    #[tokio::test]
    async fn duplicate_slug_conflicts() {
        let store = Sqlite::new_in_memory().await;
        let a = sample("brave-otter-ab12");
        let mut b = sample("brave-otter-ab12");
        b.id = DeploymentId::new();

        store.insert(&a).await.unwrap();
        let err = store.insert(&b).await.unwrap_err();
        assert_eq!(err.error_kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn update_status_on_missing_row_is_not_found() {
        let store = Sqlite::new_in_memory().await;
        let err = store
            .update_status(&DeploymentId::new(), Status::Live)
            .await
            .unwrap_err();
        assert_eq!(err.error_kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn list_is_ordered_newest_first() {
        let store = Sqlite::new_in_memory().await;
        let mut first = sample("alpha-wolf-0001");
        first.created_at = Utc::now() - Duration::seconds(10);
        let second = sample("beta-hawk-0002");

        store.insert(&first).await.unwrap();
        store.insert(&second).await.unwrap();

        let rows = store.list().await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].slug, second.slug);
    }

    #[tokio::test]
    async fn list_expired_live_only_matches_live_and_past_expiry() {
        let store = Sqlite::new_in_memory().await;

        let mut expired_live = sample("expired-live-0001");
        expired_live.status = Status::Live;
        expired_live.expires_at = Some(Utc::now() - Duration::seconds(5));

        let mut expired_failed = sample("expired-failed-0002");
        expired_failed.status = Status::Failed;
        expired_failed.expires_at = Some(Utc::now() - Duration::seconds(5));

        let mut not_yet_expired = sample("future-live-0003");
        not_yet_expired.status = Status::Live;
        not_yet_expired.expires_at = Some(Utc::now() + Duration::seconds(60));

        store.insert(&expired_live).await.unwrap();
        store.insert(&expired_failed).await.unwrap();
        store.insert(&not_yet_expired).await.unwrap();

        let rows = store.list_expired_live().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].slug, expired_live.slug);
    }

    #[tokio::test]
    async fn delete_missing_row_is_not_found() {
        let store = Sqlite::new_in_memory().await;
        let err = store.delete(&DeploymentId::new()).await.unwrap_err();
        assert_eq!(err.error_kind(), ErrorKind::NotFound);
    }
}
