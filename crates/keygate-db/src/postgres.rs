//! Postgres Entitlement Store
//!
//! Every check-then-set sequence runs inside a transaction or a single
//! atomic statement; issuance goes through the `create_credential_key`
//! function so concurrent webhook workers cannot double-issue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use uuid::Uuid;

use keygate_core::{
    BillingCycle, CheckoutIntent, CheckoutStatus, CredentialKey, EntitlementStore, Error,
    IssueKey, IssueOutcome, KeyString, Profile, RedeemOutcome, RedeemRequest, Result,
    SubscriptionRecord,
};

/// Error codes raised by `create_credential_key`
const CODE_INTENT_NOT_FOUND: &str = "P0002";
const CODE_INTENT_EXPIRED: &str = "P0003";

/// Postgres-backed [`EntitlementStore`]
pub struct PgEntitlementStore {
    pool: PgPool,
}

impl PgEntitlementStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(db_err)?;
        Ok(Self { pool })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply embedded migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn db_err(e: sqlx::Error) -> Error {
    Error::Storage(e.to_string())
}

fn cycle_from(raw: &str) -> Result<BillingCycle> {
    BillingCycle::parse(raw).map_err(|_| Error::Storage(format!("bad billing_cycle: {raw}")))
}

fn status_from(raw: &str) -> Result<CheckoutStatus> {
    CheckoutStatus::parse(raw).ok_or_else(|| Error::Storage(format!("bad status: {raw}")))
}

fn intent_from_row(row: &PgRow) -> Result<CheckoutIntent> {
    Ok(CheckoutIntent {
        id: row.try_get("id").map_err(db_err)?,
        provider_session_id: row.try_get("provider_session_id").map_err(db_err)?,
        email: row.try_get("email").map_err(db_err)?,
        user_id: row.try_get("user_id").map_err(db_err)?,
        plan_id: row.try_get("plan_id").map_err(db_err)?,
        billing_cycle: cycle_from(row.try_get::<String, _>("billing_cycle").map_err(db_err)?.as_str())?,
        status: status_from(row.try_get::<String, _>("status").map_err(db_err)?.as_str())?,
        credential_key_id: row.try_get("credential_key_id").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn key_from_row(row: &PgRow) -> Result<CredentialKey> {
    Ok(CredentialKey {
        id: row.try_get("id").map_err(db_err)?,
        key: KeyString::from_string(row.try_get::<String, _>("key").map_err(db_err)?),
        email: row.try_get("email").map_err(db_err)?,
        plan_id: row.try_get("plan_id").map_err(db_err)?,
        billing_cycle: cycle_from(row.try_get::<String, _>("billing_cycle").map_err(db_err)?.as_str())?,
        provider_customer_id: row.try_get("provider_customer_id").map_err(db_err)?,
        provider_subscription_id: row.try_get("provider_subscription_id").map_err(db_err)?,
        issued_at: row.try_get("issued_at").map_err(db_err)?,
        expires_at: row.try_get("expires_at").map_err(db_err)?,
        is_redeemed: row.try_get("is_redeemed").map_err(db_err)?,
        redeemed_at: row.try_get("redeemed_at").map_err(db_err)?,
        redeemed_by: row.try_get("redeemed_by").map_err(db_err)?,
    })
}

fn profile_from_row(row: &PgRow) -> Result<Profile> {
    Ok(Profile {
        id: row.try_get("id").map_err(db_err)?,
        auth_user_id: row.try_get("auth_user_id").map_err(db_err)?,
        email: row.try_get("email").map_err(db_err)?,
        plan_id: row.try_get("plan_id").map_err(db_err)?,
        subscription_status: row.try_get("subscription_status").map_err(db_err)?,
        credential_key_id: row.try_get("credential_key_id").map_err(db_err)?,
        password_set: row.try_get("password_set").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn subscription_from_row(row: &PgRow) -> Result<SubscriptionRecord> {
    Ok(SubscriptionRecord {
        provider_subscription_id: row.try_get("provider_subscription_id").map_err(db_err)?,
        provider_customer_id: row.try_get("provider_customer_id").map_err(db_err)?,
        status: row.try_get("status").map_err(db_err)?,
        current_period_start: row.try_get("current_period_start").map_err(db_err)?,
        current_period_end: row.try_get("current_period_end").map_err(db_err)?,
        canceled_at: row.try_get("canceled_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

#[async_trait]
impl EntitlementStore for PgEntitlementStore {
    fn kind(&self) -> &'static str {
        "postgres"
    }

    async fn create_intent(&self, intent: CheckoutIntent) -> Result<()> {
        sqlx::query(
            "INSERT INTO checkout_intents \
             (id, provider_session_id, email, user_id, plan_id, billing_cycle, status, credential_key_id, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(intent.id)
        .bind(&intent.provider_session_id)
        .bind(&intent.email)
        .bind(&intent.user_id)
        .bind(&intent.plan_id)
        .bind(intent.billing_cycle.as_str())
        .bind(intent.status.as_str())
        .bind(intent.credential_key_id)
        .bind(intent.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn intent(&self, id: Uuid) -> Result<Option<CheckoutIntent>> {
        sqlx::query("SELECT * FROM checkout_intents WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(|row| intent_from_row(&row))
            .transpose()
    }

    async fn intent_by_session(
        &self,
        provider_session_id: &str,
    ) -> Result<Option<CheckoutIntent>> {
        sqlx::query("SELECT * FROM checkout_intents WHERE provider_session_id = $1")
            .bind(provider_session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(|row| intent_from_row(&row))
            .transpose()
    }

    async fn attach_provider_session(
        &self,
        intent_id: Uuid,
        provider_session_id: &str,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE checkout_intents \
             SET provider_session_id = $2, \
                 status = CASE WHEN status = 'pending' THEN 'created' ELSE status END \
             WHERE id = $1",
        )
        .bind(intent_id)
        .bind(provider_session_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(Error::SessionNotFound(intent_id.to_string()));
        }
        Ok(())
    }

    async fn complete_checkout(&self, intent_id: Uuid, issue: IssueKey) -> Result<IssueOutcome> {
        // Generated up front; discarded when the race was already won
        let key = CredentialKey::issue(&issue, Utc::now());

        let row = sqlx::query(
            "SELECT credential_key_id, newly_issued \
             FROM create_credential_key($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(intent_id)
        .bind(key.id)
        .bind(key.key.as_str())
        .bind(&key.email)
        .bind(&key.plan_id)
        .bind(key.billing_cycle.as_str())
        .bind(key.issued_at)
        .bind(key.expires_at)
        .bind(&key.provider_customer_id)
        .bind(&key.provider_subscription_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(db) = &e {
                match db.code().as_deref() {
                    Some(CODE_INTENT_NOT_FOUND) => {
                        return Error::SessionNotFound(intent_id.to_string());
                    }
                    Some(CODE_INTENT_EXPIRED) => return Error::SessionExpired,
                    _ => {}
                }
            }
            db_err(e)
        })?;

        let issued_id: Uuid = row.try_get("credential_key_id").map_err(db_err)?;
        let newly_issued: bool = row.try_get("newly_issued").map_err(db_err)?;

        if newly_issued {
            return Ok(IssueOutcome {
                key,
                newly_issued: true,
            });
        }

        let key = self
            .credential_key_by_id(issued_id)
            .await?
            .ok_or_else(|| Error::Storage(format!("credential key {issued_id} missing")))?;
        Ok(IssueOutcome {
            key,
            newly_issued: false,
        })
    }

    async fn expire_checkout(&self, intent_id: Uuid) -> Result<()> {
        let result = sqlx::query(
            "UPDATE checkout_intents SET status = 'expired' \
             WHERE id = $1 AND status <> 'completed'",
        )
        .bind(intent_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            let exists = sqlx::query("SELECT 1 FROM checkout_intents WHERE id = $1")
                .bind(intent_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
            if exists.is_none() {
                return Err(Error::SessionNotFound(intent_id.to_string()));
            }
            tracing::debug!(intent_id = %intent_id, "late expiry ignored for completed checkout");
        }
        Ok(())
    }

    async fn credential_key(&self, key: &str) -> Result<Option<CredentialKey>> {
        let normalized = KeyString::from_string(key);
        sqlx::query("SELECT * FROM credential_keys WHERE key = $1")
            .bind(normalized.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(|row| key_from_row(&row))
            .transpose()
    }

    async fn credential_key_by_id(&self, id: Uuid) -> Result<Option<CredentialKey>> {
        sqlx::query("SELECT * FROM credential_keys WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(|row| key_from_row(&row))
            .transpose()
    }

    async fn redeem_key(&self, request: RedeemRequest) -> Result<RedeemOutcome> {
        let now = Utc::now();
        let normalized = KeyString::from_string(&request.key);

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query("SELECT * FROM credential_keys WHERE key = $1 FOR UPDATE")
            .bind(normalized.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or(Error::KeyNotFound)?;

        let mut key = key_from_row(&row)?;
        key.check_redeemable(&request.email, now)?;

        sqlx::query(
            "UPDATE credential_keys \
             SET is_redeemed = TRUE, redeemed_at = $2, redeemed_by = $3 \
             WHERE id = $1",
        )
        .bind(key.id)
        .bind(now)
        .bind(&request.user_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        key.is_redeemed = true;
        key.redeemed_at = Some(now);
        key.redeemed_by = request.user_id.clone();

        let profile = match &request.user_id {
            Some(user_id) => {
                let updated = sqlx::query(
                    "UPDATE profiles \
                     SET plan_id = $2, credential_key_id = $3, \
                         subscription_status = 'active', password_set = TRUE \
                     WHERE auth_user_id = $1 \
                     RETURNING *",
                )
                .bind(user_id)
                .bind(&key.plan_id)
                .bind(key.id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?;

                match updated {
                    Some(row) => profile_from_row(&row)?,
                    None => {
                        let profile = Profile::for_user(
                            user_id,
                            key.email.clone(),
                            key.plan_id.clone(),
                            key.id,
                        );
                        insert_profile(&mut tx, &profile).await?;
                        profile
                    }
                }
            }
            None => {
                let profile =
                    Profile::passwordless(key.email.clone(), key.plan_id.clone(), key.id);
                insert_profile(&mut tx, &profile).await?;
                profile
            }
        };

        tx.commit().await.map_err(db_err)?;
        Ok(RedeemOutcome { key, profile })
    }

    async fn link_profile(&self, profile_id: Uuid, auth_user_id: &str) -> Result<Profile> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query("SELECT * FROM profiles WHERE id = $1 FOR UPDATE")
            .bind(profile_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or(Error::ProfileNotFound(profile_id))?;

        let mut profile = profile_from_row(&row)?;

        match profile.auth_user_id.as_deref() {
            Some(existing) if existing == auth_user_id => {} // re-link is a no-op
            Some(_) => return Err(Error::ProfileAlreadyLinked(profile_id)),
            None => {
                sqlx::query(
                    "UPDATE profiles SET auth_user_id = $2, password_set = TRUE WHERE id = $1",
                )
                .bind(profile_id)
                .bind(auth_user_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
                profile.auth_user_id = Some(auth_user_id.to_string());
                profile.password_set = true;
            }
        }

        tx.commit().await.map_err(db_err)?;
        Ok(profile)
    }

    async fn upsert_subscription(&self, record: SubscriptionRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO subscriptions \
             (provider_subscription_id, provider_customer_id, status, \
              current_period_start, current_period_end, canceled_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (provider_subscription_id) DO UPDATE SET \
                 provider_customer_id = EXCLUDED.provider_customer_id, \
                 status = EXCLUDED.status, \
                 current_period_start = EXCLUDED.current_period_start, \
                 current_period_end = EXCLUDED.current_period_end, \
                 canceled_at = EXCLUDED.canceled_at, \
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(&record.provider_subscription_id)
        .bind(&record.provider_customer_id)
        .bind(&record.status)
        .bind(record.current_period_start)
        .bind(record.current_period_end)
        .bind(record.canceled_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn cancel_subscription(
        &self,
        provider_subscription_id: &str,
        canceled_at: DateTime<Utc>,
    ) -> Result<()> {
        // Upsert so a deletion event for a never-seen subscription still
        // leaves a consistent mirror row
        sqlx::query(
            "INSERT INTO subscriptions \
             (provider_subscription_id, status, canceled_at, updated_at) \
             VALUES ($1, 'canceled', $2, now()) \
             ON CONFLICT (provider_subscription_id) DO UPDATE SET \
                 status = 'canceled', \
                 canceled_at = EXCLUDED.canceled_at, \
                 updated_at = now()",
        )
        .bind(provider_subscription_id)
        .bind(canceled_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn subscription(
        &self,
        provider_subscription_id: &str,
    ) -> Result<Option<SubscriptionRecord>> {
        sqlx::query("SELECT * FROM subscriptions WHERE provider_subscription_id = $1")
            .bind(provider_subscription_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(|row| subscription_from_row(&row))
            .transpose()
    }
}

async fn insert_profile(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    profile: &Profile,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO profiles \
         (id, auth_user_id, email, plan_id, subscription_status, credential_key_id, password_set, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(profile.id)
    .bind(&profile.auth_user_id)
    .bind(&profile.email)
    .bind(&profile.plan_id)
    .bind(&profile.subscription_status)
    .bind(profile.credential_key_id)
    .bind(profile.password_set)
    .bind(profile.created_at)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(())
}
