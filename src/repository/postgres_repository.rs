//! PostgreSQL repository provider.
//!
//! Uses runtime-checked queries against the tables created by
//! `sql/schema.sql`. JSONB columns are decoded with `sqlx::types::Json`.

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::FromRow;

use super::{Repository, RepositoryError, Stat};
use crate::encryption::EncryptionType;
use crate::format::CustomFormat;
use crate::postgres::PostgresPool;
use crate::tenant::{AppFormat, Application, Target, TargetArgs, User};

const APPLICATION_COLUMNS: &str = r#"
    a.token, a.enable, a.name, a.icon_path, a.format, a.custom_format,
    a.encryption_type, a.encryption_recipients, a.encrypt_title,
    a.encrypt_message, a.encrypt_attachment, a.target_id AS target, a.target_args
"#;

#[derive(Debug, FromRow)]
struct UserRow {
    key: String,
    enable: bool,
}

#[derive(Debug, FromRow)]
struct ApplicationRow {
    token: String,
    enable: bool,
    name: String,
    icon_path: Option<String>,
    format: String,
    custom_format: Json<CustomFormat>,
    encryption_type: String,
    encryption_recipients: Vec<String>,
    encrypt_title: bool,
    encrypt_message: bool,
    encrypt_attachment: bool,
    target: String,
    target_args: Json<TargetArgs>,
}

impl TryFrom<ApplicationRow> for Application {
    type Error = RepositoryError;

    fn try_from(row: ApplicationRow) -> Result<Self, Self::Error> {
        let format = row
            .format
            .parse::<AppFormat>()
            .map_err(RepositoryError::InvalidData)?;
        let encryption_type = row
            .encryption_type
            .parse::<EncryptionType>()
            .map_err(|e| RepositoryError::InvalidData(e.to_string()))?;

        Ok(Application {
            token: row.token,
            enable: row.enable,
            name: row.name,
            icon_path: row.icon_path,
            format,
            custom_format: row.custom_format.0,
            encryption_type,
            encryption_recipients: row.encryption_recipients,
            encrypt_title: row.encrypt_title,
            encrypt_message: row.encrypt_message,
            encrypt_attachment: row.encrypt_attachment,
            target: row.target,
            target_args: row.target_args.0,
        })
    }
}

#[derive(Debug, FromRow)]
struct TargetRow {
    id: String,
    enable: bool,
    #[sqlx(rename = "type")]
    kind: String,
    args: Json<TargetArgs>,
}

impl From<TargetRow> for Target {
    fn from(row: TargetRow) -> Self {
        Target {
            id: row.id,
            enable: row.enable,
            kind: row.kind,
            args: row.args.0,
        }
    }
}

/// PostgreSQL-backed repository.
pub struct PostgresRepository {
    pool: PostgresPool,
}

impl PostgresRepository {
    pub fn new(pool: PostgresPool) -> Self {
        Self { pool }
    }

    async fn applications_of(&self, user_key: &str) -> Result<Vec<Application>, RepositoryError> {
        let query = format!(
            "SELECT {} FROM applications a JOIN users u ON u.id = a.user_id \
             WHERE u.key = $1 ORDER BY a.created_at, a.token",
            APPLICATION_COLUMNS
        );

        let rows: Vec<ApplicationRow> = sqlx::query_as(&query)
            .bind(user_key)
            .fetch_all(self.pool.pool())
            .await?;

        rows.into_iter().map(Application::try_from).collect()
    }
}

#[async_trait]
impl Repository for PostgresRepository {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn get_user_from_token(&self, token: &str) -> Result<User, RepositoryError> {
        let row: Option<UserRow> = sqlx::query_as(
            "SELECT u.key, u.enable FROM users u \
             JOIN applications a ON a.user_id = u.id WHERE a.token = $1",
        )
        .bind(token)
        .fetch_optional(self.pool.pool())
        .await?;

        let row = row.ok_or(RepositoryError::NotFound)?;
        let applications = self.applications_of(&row.key).await?;

        Ok(User {
            key: row.key,
            enable: row.enable,
            applications,
        })
    }

    async fn get_application(
        &self,
        user_key: &str,
        token: &str,
    ) -> Result<Application, RepositoryError> {
        let query = format!(
            "SELECT {} FROM applications a JOIN users u ON u.id = a.user_id \
             WHERE a.token = $1 AND u.key = $2",
            APPLICATION_COLUMNS
        );

        let row: Option<ApplicationRow> = sqlx::query_as(&query)
            .bind(token)
            .bind(user_key)
            .fetch_optional(self.pool.pool())
            .await?;

        row.ok_or(RepositoryError::NotFound)?.try_into()
    }

    async fn get_targets(&self) -> Result<Vec<Target>, RepositoryError> {
        let rows: Vec<TargetRow> =
            sqlx::query_as("SELECT id, enable, type, args FROM targets ORDER BY id")
                .fetch_all(self.pool.pool())
                .await?;

        Ok(rows.into_iter().map(Target::from).collect())
    }

    async fn get_target_by_id(&self, id: &str) -> Result<Target, RepositoryError> {
        let row: Option<TargetRow> =
            sqlx::query_as("SELECT id, enable, type, args FROM targets WHERE id = $1")
                .bind(id)
                .fetch_optional(self.pool.pool())
                .await?;

        row.map(Target::from).ok_or(RepositoryError::NotFound)
    }

    async fn increment_stat(&self, token: &str, stat: Stat) -> Result<(), RepositoryError> {
        // Column names come from the closed `Stat` enum.
        let query = format!(
            "UPDATE applications SET {column} = {column} + 1 WHERE token = $1",
            column = stat.column()
        );

        let result = sqlx::query(&query)
            .bind(token)
            .execute(self.pool.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn save_input(&self, token: &str, dump: &str) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE applications SET stat_received = stat_received + 1, \
             latest_input = CASE WHEN store_latest_input THEN $2 ELSE latest_input END \
             WHERE token = $1",
        )
        .bind(token)
        .bind(dump)
        .execute(self.pool.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<(), RepositoryError> {
        self.pool.ping().await.map_err(RepositoryError::Database)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
