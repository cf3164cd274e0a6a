//! PostgreSQL adapter on `sqlx`.
//!
//! DDL cannot take bind parameters, so identifiers and password literals are
//! quoted here. Error messages carry a statement label, never the SQL text.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgSslMode};
use sqlx::Connection;
use tracing::{debug, warn};

use super::{
    AdminCredential, DatabaseEndpoint, DatabaseEngine, DatabaseError, DatabaseSession,
    PasswordChange, SslMode,
};
use crate::config::DatabaseConfig;
use crate::retry::{retry_transient, RetryConfig};

/// SQLSTATEs for rejected credentials.
const INVALID_PASSWORD: &str = "28P01";
const INVALID_AUTHORIZATION: &str = "28000";

/// Engine adapter for a PostgreSQL server.
#[derive(Debug, Clone)]
pub struct PostgresEngine {
    endpoint: DatabaseEndpoint,
    maintenance_database: String,
    connect_timeout: Duration,
    retry: RetryConfig,
}

impl PostgresEngine {
    #[must_use]
    pub fn new(config: &DatabaseConfig, retry: RetryConfig) -> Self {
        Self {
            endpoint: DatabaseEndpoint {
                host: config.host.clone(),
                port: config.port,
                ssl_mode: config.ssl_mode,
            },
            maintenance_database: config.maintenance_database.clone(),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            retry,
        }
    }

    fn options(&self, user: &str, password: &str, database: &str) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.endpoint.host)
            .port(self.endpoint.port)
            .username(user)
            .password(password)
            .database(database)
            .ssl_mode(pg_ssl_mode(self.endpoint.ssl_mode))
    }

    async fn open(
        &self,
        user: &str,
        password: &str,
        database: &str,
    ) -> Result<PgConnection, DatabaseError> {
        let options = self.options(user, password, database);
        retry_transient(&self.retry, "database connect", DatabaseError::is_transient, || async {
            match tokio::time::timeout(self.connect_timeout, PgConnection::connect_with(&options))
                .await
            {
                Ok(Ok(conn)) => Ok(conn),
                Ok(Err(e)) => Err(self.connect_error(user, &e)),
                Err(_) => Err(DatabaseError::Unreachable {
                    host: self.endpoint.host.clone(),
                    port: self.endpoint.port,
                    message: format!("no response within {}s", self.connect_timeout.as_secs()),
                }),
            }
        })
        .await
    }

    fn connect_error(&self, user: &str, error: &sqlx::Error) -> DatabaseError {
        if let sqlx::Error::Database(db) = error {
            if matches!(
                db.code().as_deref(),
                Some(INVALID_PASSWORD | INVALID_AUTHORIZATION)
            ) {
                return DatabaseError::AuthenticationFailed {
                    role: user.to_string(),
                };
            }
            // The server answered, so retrying will not help.
            return statement_error("connect", error);
        }
        DatabaseError::Unreachable {
            host: self.endpoint.host.clone(),
            port: self.endpoint.port,
            message: error.to_string(),
        }
    }
}

fn pg_ssl_mode(mode: SslMode) -> PgSslMode {
    match mode {
        SslMode::Disable => PgSslMode::Disable,
        SslMode::Allow => PgSslMode::Allow,
        SslMode::Prefer => PgSslMode::Prefer,
        SslMode::Require => PgSslMode::Require,
        SslMode::VerifyCa => PgSslMode::VerifyCa,
        SslMode::VerifyFull => PgSslMode::VerifyFull,
    }
}

/// Quote an identifier: `acme-alpha` becomes `"acme-alpha"`.
pub(crate) fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote a string literal.
pub(crate) fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn statement_error(statement: &str, error: &sqlx::Error) -> DatabaseError {
    let message = match error {
        sqlx::Error::Database(db) => db.message().to_string(),
        other => other.to_string(),
    };
    DatabaseError::Statement {
        statement: statement.to_string(),
        message,
    }
}

#[async_trait]
impl DatabaseEngine for PostgresEngine {
    async fn connect(
        &self,
        admin: &AdminCredential,
    ) -> Result<Box<dyn DatabaseSession>, DatabaseError> {
        let conn = self
            .open(&admin.user, &admin.password, &self.maintenance_database)
            .await?;
        debug!(
            host = %self.endpoint.host,
            port = self.endpoint.port,
            user = %admin.user,
            "Opened administrative database session"
        );
        Ok(Box::new(PgSession { conn }))
    }

    async fn verify_login(
        &self,
        user: &str,
        password: &str,
        database: &str,
    ) -> Result<bool, DatabaseError> {
        match self.open(user, password, database).await {
            Ok(conn) => {
                if let Err(e) = conn.close().await {
                    warn!(user = %user, error = %e, "Failed to close verification connection");
                }
                Ok(true)
            }
            Err(DatabaseError::AuthenticationFailed { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn endpoint(&self) -> DatabaseEndpoint {
        self.endpoint.clone()
    }
}

struct PgSession {
    conn: PgConnection,
}

impl PgSession {
    async fn execute(&mut self, label: &str, sql: &str) -> Result<(), DatabaseError> {
        sqlx::Executor::execute(&mut self.conn, sqlx::raw_sql(sql))
            .await
            .map_err(|e| statement_error(label, &e))?;
        Ok(())
    }

    async fn exists(&mut self, label: &str, query: &str, name: &str) -> Result<bool, DatabaseError> {
        sqlx::query_scalar::<_, bool>(query)
            .bind(name)
            .fetch_one(&mut self.conn)
            .await
            .map_err(|e| statement_error(label, &e))
    }
}

#[async_trait]
impl DatabaseSession for PgSession {
    async fn role_exists(&mut self, role: &str) -> Result<bool, DatabaseError> {
        self.exists(
            "role lookup",
            "SELECT EXISTS (SELECT 1 FROM pg_roles WHERE rolname = $1)",
            role,
        )
        .await
    }

    async fn create_role(&mut self, role: &str, password: &str) -> Result<(), DatabaseError> {
        let sql = format!(
            "CREATE ROLE {} LOGIN PASSWORD {}",
            quote_ident(role),
            quote_literal(password)
        );
        self.execute(&format!("CREATE ROLE {role}"), &sql).await
    }

    async fn alter_role_password(
        &mut self,
        role: &str,
        password: &str,
    ) -> Result<(), DatabaseError> {
        let sql = format!(
            "ALTER ROLE {} WITH LOGIN PASSWORD {}",
            quote_ident(role),
            quote_literal(password)
        );
        self.execute(&format!("ALTER ROLE {role}"), &sql).await
    }

    async fn database_exists(&mut self, database: &str) -> Result<bool, DatabaseError> {
        self.exists(
            "database lookup",
            "SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname = $1)",
            database,
        )
        .await
    }

    async fn create_database(&mut self, database: &str, owner: &str) -> Result<(), DatabaseError> {
        let sql = format!(
            "CREATE DATABASE {} OWNER {}",
            quote_ident(database),
            quote_ident(owner)
        );
        self.execute(&format!("CREATE DATABASE {database}"), &sql)
            .await
    }

    async fn grant_all(&mut self, database: &str, role: &str) -> Result<(), DatabaseError> {
        let sql = format!(
            "GRANT ALL PRIVILEGES ON DATABASE {} TO {}",
            quote_ident(database),
            quote_ident(role)
        );
        self.execute(&format!("GRANT ALL ON DATABASE {database}"), &sql)
            .await
    }

    async fn change_passwords(&mut self, changes: &[PasswordChange]) -> Result<(), DatabaseError> {
        let mut tx = self
            .conn
            .begin()
            .await
            .map_err(|e| statement_error("BEGIN", &e))?;

        for change in changes {
            let sql = format!(
                "ALTER ROLE {} WITH PASSWORD {}",
                quote_ident(&change.role),
                quote_literal(&change.password)
            );
            // Dropping `tx` on error rolls every change back.
            sqlx::Executor::execute(&mut *tx, sqlx::raw_sql(&sql))
                .await
                .map_err(|e| statement_error(&format!("ALTER ROLE {}", change.role), &e))?;
        }

        tx.commit()
            .await
            .map_err(|e| statement_error("COMMIT", &e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_quoting() {
        assert_eq!(quote_ident("acme-alpha"), "\"acme-alpha\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_literal_quoting() {
        assert_eq!(quote_literal("abc"), "'abc'");
        assert_eq!(quote_literal("it's"), "'it''s'");
    }

    #[test]
    fn test_statement_errors_omit_sql() {
        let err = statement_error("ALTER ROLE acme", &sqlx::Error::PoolClosed);
        let rendered = err.to_string();
        assert!(rendered.starts_with("ALTER ROLE acme rejected"));
        assert!(!rendered.contains("PASSWORD"));
    }

    #[test]
    fn test_engine_reports_configured_endpoint() {
        let config = DatabaseConfig {
            host: "db.internal".into(),
            port: 6432,
            ssl_mode: SslMode::Require,
            ..DatabaseConfig::default()
        };
        let engine = PostgresEngine::new(&config, RetryConfig::default());
        assert_eq!(
            engine.endpoint(),
            DatabaseEndpoint {
                host: "db.internal".into(),
                port: 6432,
                ssl_mode: SslMode::Require,
            }
        );
    }
}
