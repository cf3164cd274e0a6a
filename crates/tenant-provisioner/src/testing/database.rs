use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::database::{
    AdminCredential, DatabaseEndpoint, DatabaseEngine, DatabaseError, DatabaseSession,
    PasswordChange, SslMode,
};

#[derive(Debug, Default)]
struct State {
    /// role -> password
    roles: BTreeMap<String, String>,
    /// database -> owner
    databases: BTreeMap<String, String>,
    grants: BTreeSet<(String, String)>,
    unreachable: bool,
    failing: Vec<String>,
    sessions: usize,
}

impl State {
    fn check(&self, statement: &str) -> Result<(), DatabaseError> {
        if self.unreachable {
            return Err(unreachable());
        }
        if self.failing.iter().any(|prefix| statement.starts_with(prefix.as_str())) {
            return Err(DatabaseError::Statement {
                statement: statement.to_string(),
                message: "permission denied".into(),
            });
        }
        Ok(())
    }
}

fn unreachable() -> DatabaseError {
    DatabaseError::Unreachable {
        host: "fake-db".into(),
        port: 5432,
        message: "connection refused".into(),
    }
}

/// In-memory database engine with PostgreSQL-like role semantics.
#[derive(Debug, Clone, Default)]
pub struct FakeDatabase {
    state: Arc<Mutex<State>>,
}

impl FakeDatabase {
    /// Engine whose `postgres` superuser has `admin_password`.
    #[must_use]
    pub fn new(admin_password: &str) -> Self {
        let database = Self::default();
        {
            let mut state = database.state();
            state
                .roles
                .insert("postgres".into(), admin_password.to_string());
            state.databases.insert("postgres".into(), "postgres".into());
        }
        database
    }

    /// Add a login role.
    #[must_use]
    pub fn with_role(self, role: &str, password: &str) -> Self {
        self.set_role_password(role, password);
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    /// Reject every statement whose label starts with `prefix`.
    pub fn fail_statement(&self, prefix: &str) {
        self.state().failing.push(prefix.to_string());
    }

    /// Change a role password behind the provisioner's back.
    pub fn set_role_password(&self, role: &str, password: &str) {
        self.state()
            .roles
            .insert(role.to_string(), password.to_string());
    }

    #[must_use]
    pub fn role_password(&self, role: &str) -> Option<String> {
        self.state().roles.get(role).cloned()
    }

    #[must_use]
    pub fn has_database(&self, database: &str) -> bool {
        self.state().databases.contains_key(database)
    }

    #[must_use]
    pub fn has_grant(&self, database: &str, role: &str) -> bool {
        self.state()
            .grants
            .contains(&(database.to_string(), role.to_string()))
    }

    /// Number of administrative sessions opened.
    #[must_use]
    pub fn sessions(&self) -> usize {
        self.state().sessions
    }
}

#[async_trait]
impl DatabaseEngine for FakeDatabase {
    async fn connect(
        &self,
        admin: &AdminCredential,
    ) -> Result<Box<dyn DatabaseSession>, DatabaseError> {
        let mut state = self.state();
        if state.unreachable {
            return Err(unreachable());
        }
        if state.roles.get(&admin.user) != Some(&admin.password) {
            return Err(DatabaseError::AuthenticationFailed {
                role: admin.user.clone(),
            });
        }
        state.sessions += 1;
        Ok(Box::new(FakeSession {
            state: Arc::clone(&self.state),
        }))
    }

    async fn verify_login(
        &self,
        user: &str,
        password: &str,
        database: &str,
    ) -> Result<bool, DatabaseError> {
        let state = self.state();
        if state.unreachable {
            return Err(unreachable());
        }
        Ok(state.roles.get(user).map(String::as_str) == Some(password)
            && state.databases.contains_key(database))
    }

    fn endpoint(&self) -> DatabaseEndpoint {
        DatabaseEndpoint {
            host: "fake-db".into(),
            port: 5432,
            ssl_mode: SslMode::Disable,
        }
    }
}

struct FakeSession {
    state: Arc<Mutex<State>>,
}

impl FakeSession {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl DatabaseSession for FakeSession {
    async fn role_exists(&mut self, role: &str) -> Result<bool, DatabaseError> {
        let state = self.state();
        state.check("role lookup")?;
        Ok(state.roles.contains_key(role))
    }

    async fn create_role(&mut self, role: &str, password: &str) -> Result<(), DatabaseError> {
        let mut state = self.state();
        state.check(&format!("CREATE ROLE {role}"))?;
        if state.roles.contains_key(role) {
            return Err(DatabaseError::Statement {
                statement: format!("CREATE ROLE {role}"),
                message: "role already exists".into(),
            });
        }
        state.roles.insert(role.to_string(), password.to_string());
        Ok(())
    }

    async fn alter_role_password(
        &mut self,
        role: &str,
        password: &str,
    ) -> Result<(), DatabaseError> {
        let mut state = self.state();
        state.check(&format!("ALTER ROLE {role}"))?;
        match state.roles.get_mut(role) {
            Some(current) => {
                *current = password.to_string();
                Ok(())
            }
            None => Err(DatabaseError::Statement {
                statement: format!("ALTER ROLE {role}"),
                message: "role does not exist".into(),
            }),
        }
    }

    async fn database_exists(&mut self, database: &str) -> Result<bool, DatabaseError> {
        let state = self.state();
        state.check("database lookup")?;
        Ok(state.databases.contains_key(database))
    }

    async fn create_database(&mut self, database: &str, owner: &str) -> Result<(), DatabaseError> {
        let mut state = self.state();
        state.check(&format!("CREATE DATABASE {database}"))?;
        if state.databases.contains_key(database) {
            return Err(DatabaseError::Statement {
                statement: format!("CREATE DATABASE {database}"),
                message: "database already exists".into(),
            });
        }
        state
            .databases
            .insert(database.to_string(), owner.to_string());
        Ok(())
    }

    async fn grant_all(&mut self, database: &str, role: &str) -> Result<(), DatabaseError> {
        let mut state = self.state();
        state.check(&format!("GRANT ALL ON DATABASE {database}"))?;
        state
            .grants
            .insert((database.to_string(), role.to_string()));
        Ok(())
    }

    async fn change_passwords(&mut self, changes: &[PasswordChange]) -> Result<(), DatabaseError> {
        let mut state = self.state();
        for change in changes {
            let statement = format!("ALTER ROLE {}", change.role);
            state.check(&statement)?;
            if !state.roles.contains_key(&change.role) {
                return Err(DatabaseError::Statement {
                    statement,
                    message: "role does not exist".into(),
                });
            }
        }
        for change in changes {
            state
                .roles
                .insert(change.role.clone(), change.password.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admin(password: &str) -> AdminCredential {
        AdminCredential {
            user: "postgres".into(),
            password: password.into(),
        }
    }

    #[tokio::test]
    async fn test_connect_requires_admin_password() {
        let database = FakeDatabase::new("secret");
        assert!(database.connect(&admin("secret")).await.is_ok());
        assert!(matches!(
            database.connect(&admin("wrong")).await,
            Err(DatabaseError::AuthenticationFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_password_changes_are_all_or_nothing() {
        let database = FakeDatabase::new("secret").with_role("keycloak", "kc");
        let mut session = database.connect(&admin("secret")).await.unwrap();

        let result = session
            .change_passwords(&[
                PasswordChange {
                    role: "keycloak".into(),
                    password: "kc2".into(),
                },
                PasswordChange {
                    role: "missing".into(),
                    password: "x".into(),
                },
            ])
            .await;

        assert!(result.is_err());
        assert_eq!(database.role_password("keycloak").as_deref(), Some("kc"));
    }
}
