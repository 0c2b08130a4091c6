//! Account directory collaborator: resolves the pre-validated caller
//! identity string to an account row and exposes the fields the rest of the
//! system needs (id, role, email). Account management itself lives elsewhere.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::Account;

#[derive(Clone)]
pub struct AccountDirectory {
    pool: PgPool,
}

impl AccountDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_username(&self, username: &str) -> AppResult<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(
            "SELECT id, username, email, role FROM accounts WHERE username = $1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(account)
    }

    pub async fn find_by_id(&self, id: Uuid) -> AppResult<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(
            "SELECT id, username, email, role FROM accounts WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(account)
    }

    pub async fn email_of(&self, id: Uuid) -> AppResult<Option<String>> {
        let email = sqlx::query_scalar("SELECT email FROM accounts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(email)
    }
}
