//! Merchant records
//!
//! Merchants are provisioned lazily from the auth provider's opaque user id
//! and looked up by any of their unique keys (auth user id, connected account
//! id, platform customer id). Provider tokens are encrypted before they reach
//! the table and decrypted best-effort on read: a row whose ciphertext no
//! longer authenticates surfaces the stored value as-is instead of failing
//! the whole read path.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use rebill_shared::TokenCipher;

use crate::error::{RecoveryError, RecoveryResult};
use crate::plans;

/// Merchant id owning singleton system tasks. The row is seeded by the
/// migration and re-asserted by the watchdog; it is never deleted.
pub const SYSTEM_MERCHANT_ID: &str = "system";

#[derive(Debug, Clone)]
pub struct Merchant {
    pub id: String,
    pub auth_user_id: Option<String>,
    pub email: Option<String>,
    pub pp_account_id: Option<String>,
    pub pp_customer_id: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub oauth_state: Option<String>,
    pub tier: String,
    pub plan_id: String,
    pub billing_country: Option<String>,
    pub billing_address: Option<String>,
    pub from_name: Option<String>,
    pub support_email: Option<String>,
    pub brand_color: Option<String>,
    pub logo_url: Option<String>,
    pub created_at: OffsetDateTime,
}

impl Merchant {
    pub fn is_connected(&self) -> bool {
        self.pp_account_id.is_some()
    }

    pub fn plan(&self) -> &'static plans::Plan {
        plans::plan_for(&self.plan_id)
    }
}

/// Raw row with token fields still encrypted.
#[derive(Debug, sqlx::FromRow)]
struct MerchantRow {
    id: String,
    auth_user_id: Option<String>,
    email: Option<String>,
    pp_account_id: Option<String>,
    pp_customer_id: Option<String>,
    access_token: Option<String>,
    refresh_token: Option<String>,
    oauth_state: Option<String>,
    tier: String,
    plan_id: String,
    billing_country: Option<String>,
    billing_address: Option<String>,
    from_name: Option<String>,
    support_email: Option<String>,
    brand_color: Option<String>,
    logo_url: Option<String>,
    created_at: OffsetDateTime,
}

const COLUMNS: &str = "id, auth_user_id, email, pp_account_id, pp_customer_id, \
     access_token, refresh_token, oauth_state, tier, plan_id, billing_country, \
     billing_address, from_name, support_email, brand_color, logo_url, created_at";

/// Partial settings update; `None` leaves the column untouched.
#[derive(Debug, Default, Clone)]
pub struct SettingsUpdate {
    pub billing_country: Option<String>,
    pub billing_address: Option<String>,
    pub from_name: Option<String>,
    pub support_email: Option<String>,
    pub brand_color: Option<String>,
    pub logo_url: Option<String>,
}

#[derive(Clone)]
pub struct MerchantStore {
    pool: PgPool,
    cipher: TokenCipher,
}

impl MerchantStore {
    pub fn new(pool: PgPool, cipher: TokenCipher) -> Self {
        Self { pool, cipher }
    }

    fn hydrate(&self, row: MerchantRow) -> Merchant {
        Merchant {
            access_token: row
                .access_token
                .map(|t| self.reveal(&row.id, "access_token", t)),
            refresh_token: row
                .refresh_token
                .map(|t| self.reveal(&row.id, "refresh_token", t)),
            id: row.id,
            auth_user_id: row.auth_user_id,
            email: row.email,
            pp_account_id: row.pp_account_id,
            pp_customer_id: row.pp_customer_id,
            oauth_state: row.oauth_state,
            tier: row.tier,
            plan_id: row.plan_id,
            billing_country: row.billing_country,
            billing_address: row.billing_address,
            from_name: row.from_name,
            support_email: row.support_email,
            brand_color: row.brand_color,
            logo_url: row.logo_url,
            created_at: row.created_at,
        }
    }

    /// Best-effort decrypt: an unrecoverable field must not halt reads that
    /// don't touch it, so the stored value comes back verbatim.
    fn reveal(&self, merchant_id: &str, field: &str, stored: String) -> String {
        match self.cipher.decrypt(&stored) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                tracing::error!(
                    merchant_id = %merchant_id,
                    field = field,
                    error = %e,
                    "Stored token failed decryption; returning raw field"
                );
                stored
            }
        }
    }

    async fn fetch_by(&self, column: &str, value: &str) -> RecoveryResult<Option<Merchant>> {
        let sql = format!("SELECT {COLUMNS} FROM merchants WHERE {column} = $1");
        let row: Option<MerchantRow> = sqlx::query_as(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| self.hydrate(r)))
    }

    pub async fn find(&self, id: &str) -> RecoveryResult<Option<Merchant>> {
        self.fetch_by("id", id).await
    }

    pub async fn get(&self, id: &str) -> RecoveryResult<Merchant> {
        self.find(id)
            .await?
            .ok_or_else(|| RecoveryError::MerchantNotFound(id.to_string()))
    }

    pub async fn find_by_auth_user(&self, auth_user_id: &str) -> RecoveryResult<Option<Merchant>> {
        self.fetch_by("auth_user_id", auth_user_id).await
    }

    pub async fn find_by_account(&self, pp_account_id: &str) -> RecoveryResult<Option<Merchant>> {
        self.fetch_by("pp_account_id", pp_account_id).await
    }

    pub async fn find_by_customer(&self, pp_customer_id: &str) -> RecoveryResult<Option<Merchant>> {
        self.fetch_by("pp_customer_id", pp_customer_id).await
    }

    /// Look up the merchant for an authenticated user, provisioning a FREE
    /// merchant on first sight.
    ///
    /// Two requests may race on the same new user; `auth_user_id` is unique,
    /// so the losing insert falls back to the select.
    pub async fn find_or_provision(
        &self,
        auth_user_id: &str,
        email: Option<&str>,
    ) -> RecoveryResult<Merchant> {
        if let Some(existing) = self.find_by_auth_user(auth_user_id).await? {
            return Ok(existing);
        }

        let id = Uuid::new_v4().to_string();
        let sql = format!(
            "INSERT INTO merchants (id, auth_user_id, email, tier, plan_id) \
             VALUES ($1, $2, $3, 'free', $4) \
             ON CONFLICT (auth_user_id) DO NOTHING \
             RETURNING {COLUMNS}"
        );
        let inserted: Option<MerchantRow> = sqlx::query_as(&sql)
            .bind(&id)
            .bind(auth_user_id)
            .bind(email)
            .bind(plans::FREE.id)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(row) = inserted {
            tracing::info!(merchant_id = %row.id, "Provisioned new merchant");
            return Ok(self.hydrate(row));
        }

        // Lost the race; the winner's row exists now.
        self.find_by_auth_user(auth_user_id)
            .await?
            .ok_or_else(|| RecoveryError::MerchantNotFound(auth_user_id.to_string()))
    }

    pub async fn set_oauth_state(&self, id: &str, state: &str) -> RecoveryResult<()> {
        sqlx::query("UPDATE merchants SET oauth_state = $2 WHERE id = $1")
            .bind(id)
            .bind(state)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Persist a completed OAuth connection: account id, encrypted tokens,
    /// and the CSRF state cleared, in one statement.
    pub async fn complete_connection(
        &self,
        id: &str,
        account_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> RecoveryResult<()> {
        let access = self.cipher.encrypt(access_token)?;
        let refresh = refresh_token
            .map(|t| self.cipher.encrypt(t))
            .transpose()?;

        sqlx::query(
            r#"
            UPDATE merchants
            SET pp_account_id = $2,
                access_token = $3,
                refresh_token = $4,
                oauth_state = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(account_id)
        .bind(access)
        .bind(refresh)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Wipe provider credentials after a disconnect or deauthorization.
    pub async fn clear_connection(&self, id: &str) -> RecoveryResult<()> {
        sqlx::query(
            r#"
            UPDATE merchants
            SET pp_account_id = NULL,
                access_token = NULL,
                refresh_token = NULL,
                oauth_state = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_plan(&self, id: &str, plan_id: &str) -> RecoveryResult<()> {
        sqlx::query("UPDATE merchants SET plan_id = $2 WHERE id = $1")
            .bind(id)
            .bind(plan_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_settings(
        &self,
        id: &str,
        update: SettingsUpdate,
    ) -> RecoveryResult<Merchant> {
        let sql = format!(
            r#"
            UPDATE merchants
            SET billing_country = COALESCE($2, billing_country),
                billing_address = COALESCE($3, billing_address),
                from_name       = COALESCE($4, from_name),
                support_email   = COALESCE($5, support_email),
                brand_color     = COALESCE($6, brand_color),
                logo_url        = COALESCE($7, logo_url)
            WHERE id = $1
            RETURNING {COLUMNS}
            "#
        );
        let row: MerchantRow = sqlx::query_as(&sql)
            .bind(id)
            .bind(update.billing_country)
            .bind(update.billing_address)
            .bind(update.from_name)
            .bind(update.support_email)
            .bind(update.brand_color)
            .bind(update.logo_url)
            .fetch_one(&self.pool)
            .await?;
        Ok(self.hydrate(row))
    }

    /// Re-assert the seeded system merchant row; system tasks FK onto it.
    pub async fn ensure_system_row(&self) -> RecoveryResult<()> {
        sqlx::query(
            "INSERT INTO merchants (id, tier, plan_id) VALUES ($1, 'system', $2) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(SYSTEM_MERCHANT_ID)
        .bind(plans::FREE.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Ids of every real merchant; used by the watchdog to seed digests.
    pub async fn all_non_system_ids(&self) -> RecoveryResult<Vec<String>> {
        let ids: Vec<(String,)> =
            sqlx::query_as("SELECT id FROM merchants WHERE id <> $1 ORDER BY created_at")
                .bind(SYSTEM_MERCHANT_ID)
                .fetch_all(&self.pool)
                .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    /// Hard-delete the merchant row. Dependent tasks, logs, metrics, and
    /// templates go with it via FK cascade.
    pub async fn delete(&self, id: &str) -> RecoveryResult<()> {
        sqlx::query("DELETE FROM merchants WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
