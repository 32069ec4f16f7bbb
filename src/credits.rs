use crate::errors::AppError;
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

/// Flat credit cost per metered call type.
pub const GEO_SCAN_COST: i64 = 5;
pub const REGISTRY_SCAN_COST: i64 = 10;
pub const COMPETITOR_SCAN_COST: i64 = 15;
pub const INTENT_SCAN_COST: i64 = 15;

/// Pre-flight check-and-debit gate for metered operations.
///
/// Every scan strategy asks this before its first vendor call; a refusal
/// must abort the costed operation before any further work happens for it.
#[async_trait]
pub trait CreditGate: Send + Sync {
    async fn use_credits(
        &self,
        tenant_id: Uuid,
        amount: i64,
        source: &str,
        description: &str,
    ) -> Result<(), AppError>;
}

/// Store-backed credit gate.
///
/// The debit is a single conditional UPDATE plus a ledger insert inside one
/// transaction; there is no reservation or rollback beyond that.
pub struct CreditLedger {
    pool: PgPool,
}

impl CreditLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CreditGate for CreditLedger {
    /// Debits `amount` credits from the tenant, recording the transaction.
    ///
    /// # Errors
    ///
    /// [`AppError::InsufficientCredits`] when the balance does not cover the
    /// amount; the balance reported is the one read in the same transaction.
    async fn use_credits(
        &self,
        tenant_id: Uuid,
        amount: i64,
        source: &str,
        description: &str,
    ) -> Result<(), AppError> {
        if amount <= 0 {
            return Err(AppError::BadRequest(format!(
                "Credit amount must be positive, got {}",
                amount
            )));
        }

        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE tenants
             SET credit_balance = credit_balance - $1
             WHERE id = $2 AND credit_balance >= $1",
        )
        .bind(amount)
        .bind(tenant_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let balance: Option<i64> =
                sqlx::query_scalar("SELECT credit_balance FROM tenants WHERE id = $1")
                    .bind(tenant_id)
                    .fetch_optional(&mut *tx)
                    .await?;

            tx.rollback().await?;

            return match balance {
                Some(balance) => {
                    tracing::warn!(
                        "Credit debit refused for tenant {}: need {}, have {}",
                        tenant_id,
                        amount,
                        balance
                    );
                    Err(AppError::InsufficientCredits {
                        required: amount,
                        balance,
                    })
                }
                None => Err(AppError::NotFound(format!("Tenant {} not found", tenant_id))),
            };
        }

        sqlx::query(
            "INSERT INTO credit_transactions (tenant_id, amount, source, description)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(tenant_id)
        .bind(-amount)
        .bind(source)
        .bind(description)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            "Debited {} credit(s) from tenant {} for {}",
            amount,
            tenant_id,
            source
        );
        Ok(())
    }
}
