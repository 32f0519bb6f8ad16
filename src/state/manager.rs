//! PostgreSQL state manager

use super::{PaymentUpdate, StateStore};
use crate::config::DatabaseConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::payment::{Account, Currency, PaymentIntent};
use crate::tx::{FeeParams, NonceKey, NonceReservation, SubmissionRecord, TransferState};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info};

/// State manager for PostgreSQL persistence
pub struct StateManager {
    pool: PgPool,
}

impl StateManager {
    /// Create a new state manager
    pub async fn new(config: &DatabaseConfig) -> RelayerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> RelayerResult<()> {
        // Amounts and fees are uint256, kept as decimal text
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS payment_intents (
                id UUID PRIMARY KEY,
                account_id UUID NOT NULL,
                workspace_id UUID NOT NULL,
                wallet_address VARCHAR(42) NOT NULL,
                sub_organization_id TEXT NOT NULL,
                destination TEXT NOT NULL,
                amount VARCHAR(78) NOT NULL,
                currency VARCHAR(16) NOT NULL,
                network VARCHAR(32) NOT NULL,
                status VARCHAR(20) NOT NULL DEFAULT 'initiated',
                tx_hash VARCHAR(66),
                effective_fee VARCHAR(78),
                failure_reason TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_intents_status_created
            ON payment_intents (status, created_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tx_submissions (
                tx_hash VARCHAR(66) PRIMARY KEY,
                payment_id UUID NOT NULL,
                network VARCHAR(32) NOT NULL,
                account VARCHAR(42) NOT NULL,
                nonce BIGINT NOT NULL,
                state VARCHAR(20) NOT NULL,
                fee JSONB NOT NULL,
                gas_limit BIGINT NOT NULL,
                submitted_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                effective_fee VARCHAR(78),
                block_number BIGINT,
                replaced_by VARCHAR(66),
                failure_reason TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_submissions_slot
            ON tx_submissions (network, account, nonce)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS nonce_reservations (
                network VARCHAR(32) NOT NULL,
                account VARCHAR(42) NOT NULL,
                nonce BIGINT NOT NULL,
                lease BIGINT NOT NULL,
                replacement BOOLEAN NOT NULL,
                reserved_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (network, account, nonce)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    /// Insert an initiated intent
    pub async fn insert_intent(&self, intent: &PaymentIntent) -> RelayerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payment_intents
                (id, account_id, workspace_id, wallet_address, sub_organization_id,
                 destination, amount, currency, network)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(intent.id)
        .bind(intent.source.id)
        .bind(intent.source.workspace_id)
        .bind(format!("{:?}", intent.source.wallet_address))
        .bind(&intent.source.sub_organization_id)
        .bind(&intent.destination)
        .bind(intent.amount.to_string())
        .bind(intent.currency.code())
        .bind(&intent.network)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn corrupt(column: &str, value: &str) -> RelayerError {
    RelayerError::Internal(format!("Corrupt {} in database: {}", column, value))
}

fn parse_address(column: &str, value: &str) -> RelayerResult<Address> {
    Address::from_str(value).map_err(|_| corrupt(column, value))
}

fn parse_hash(column: &str, value: &str) -> RelayerResult<H256> {
    H256::from_str(value).map_err(|_| corrupt(column, value))
}

fn parse_u256(column: &str, value: &str) -> RelayerResult<U256> {
    U256::from_dec_str(value).map_err(|_| corrupt(column, value))
}

fn intent_from_row(row: &PgRow) -> RelayerResult<PaymentIntent> {
    let wallet: String = row.try_get("wallet_address")?;
    let amount: String = row.try_get("amount")?;
    let currency: String = row.try_get("currency")?;

    Ok(PaymentIntent {
        id: row.try_get("id")?,
        source: Account {
            id: row.try_get("account_id")?,
            workspace_id: row.try_get("workspace_id")?,
            wallet_address: parse_address("wallet_address", &wallet)?,
            sub_organization_id: row.try_get("sub_organization_id")?,
        },
        destination: row.try_get("destination")?,
        amount: parse_u256("amount", &amount)?,
        currency: Currency::from(currency),
        network: row.try_get("network")?,
    })
}

fn submission_from_row(row: &PgRow) -> RelayerResult<SubmissionRecord> {
    let tx_hash: String = row.try_get("tx_hash")?;
    let account: String = row.try_get("account")?;
    let state: String = row.try_get("state")?;
    let fee: serde_json::Value = row.try_get("fee")?;
    let effective_fee: Option<String> = row.try_get("effective_fee")?;
    let replaced_by: Option<String> = row.try_get("replaced_by")?;

    Ok(SubmissionRecord {
        tx_hash: parse_hash("tx_hash", &tx_hash)?,
        payment_id: row.try_get("payment_id")?,
        network: row.try_get("network")?,
        account: parse_address("account", &account)?,
        nonce: row.try_get::<i64, _>("nonce")? as u64,
        state: TransferState::parse(&state).ok_or_else(|| corrupt("state", &state))?,
        fee: serde_json::from_value::<FeeParams>(fee)
            .map_err(|e| RelayerError::Internal(format!("Corrupt fee in database: {}", e)))?,
        gas_limit: row.try_get::<i64, _>("gas_limit")? as u64,
        submitted_at: row.try_get::<DateTime<Utc>, _>("submitted_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        effective_fee: effective_fee
            .as_deref()
            .map(|v| parse_u256("effective_fee", v))
            .transpose()?,
        block_number: row
            .try_get::<Option<i64>, _>("block_number")?
            .map(|b| b as u64),
        replaced_by: replaced_by
            .as_deref()
            .map(|v| parse_hash("replaced_by", v))
            .transpose()?,
        failure_reason: row.try_get("failure_reason")?,
    })
}

const SUBMISSION_COLUMNS: &str = "tx_hash, payment_id, network, account, nonce, state, fee, \
     gas_limit, submitted_at, updated_at, effective_fee, block_number, replaced_by, failure_reason";

#[async_trait]
impl StateStore for StateManager {
    async fn claim_intents(&self, limit: usize) -> RelayerResult<Vec<PaymentIntent>> {
        // SKIP LOCKED lets several relayer instances claim disjoint batches
        let rows = sqlx::query(
            r#"
            UPDATE payment_intents
            SET status = 'processing', updated_at = NOW()
            WHERE id IN (
                SELECT id FROM payment_intents
                WHERE status = 'initiated'
                ORDER BY created_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, account_id, workspace_id, wallet_address, sub_organization_id,
                      destination, amount, currency, network
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let intents = rows
            .iter()
            .map(intent_from_row)
            .collect::<RelayerResult<Vec<_>>>()?;
        if !intents.is_empty() {
            debug!("Claimed {} payment intents", intents.len());
        }
        Ok(intents)
    }

    async fn update_payment(&self, update: &PaymentUpdate) -> RelayerResult<()> {
        sqlx::query(
            r#"
            UPDATE payment_intents
            SET status = $2,
                tx_hash = COALESCE($3, tx_hash),
                effective_fee = COALESCE($4, effective_fee),
                failure_reason = COALESCE($5, failure_reason),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(update.payment_id)
        .bind(update.status.as_str())
        .bind(update.tx_hash.map(|h| format!("{:?}", h)))
        .bind(update.effective_fee.map(|f| f.to_string()))
        .bind(&update.reason)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn save_submission(&self, record: &SubmissionRecord) -> RelayerResult<()> {
        let fee = serde_json::to_value(record.fee)
            .map_err(|e| RelayerError::Internal(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO tx_submissions
                (tx_hash, payment_id, network, account, nonce, state, fee, gas_limit,
                 submitted_at, updated_at, effective_fee, block_number, replaced_by, failure_reason)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (tx_hash)
            DO UPDATE SET state = $6, updated_at = $10, effective_fee = $11,
                          block_number = $12, replaced_by = $13, failure_reason = $14
            "#,
        )
        .bind(format!("{:?}", record.tx_hash))
        .bind(record.payment_id)
        .bind(&record.network)
        .bind(format!("{:?}", record.account))
        .bind(record.nonce as i64)
        .bind(record.state.as_str())
        .bind(fee)
        .bind(record.gas_limit as i64)
        .bind(record.submitted_at)
        .bind(record.updated_at)
        .bind(record.effective_fee.map(|f| f.to_string()))
        .bind(record.block_number.map(|b| b as i64))
        .bind(record.replaced_by.map(|h| format!("{:?}", h)))
        .bind(&record.failure_reason)
        .execute(&self.pool)
        .await?;

        debug!("Saved submission {:?} ({})", record.tx_hash, record.state);
        Ok(())
    }

    async fn get_submission(&self, tx_hash: H256) -> RelayerResult<Option<SubmissionRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM tx_submissions WHERE tx_hash = $1",
            SUBMISSION_COLUMNS
        ))
        .bind(format!("{:?}", tx_hash))
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(submission_from_row).transpose()
    }

    async fn open_submissions(&self) -> RelayerResult<Vec<SubmissionRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM tx_submissions \
             WHERE state NOT IN ('confirmed', 'failed', 'replaced') \
             ORDER BY submitted_at",
            SUBMISSION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(submission_from_row).collect()
    }

    async fn save_reservation(&self, reservation: &NonceReservation) -> RelayerResult<()> {
        let key = reservation.key();
        sqlx::query(
            r#"
            INSERT INTO nonce_reservations (network, account, nonce, lease, replacement)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (network, account, nonce)
            DO UPDATE SET lease = $4, replacement = $5, reserved_at = NOW()
            "#,
        )
        .bind(&key.network)
        .bind(format!("{:?}", key.account))
        .bind(reservation.nonce() as i64)
        .bind(reservation.lease() as i64)
        .bind(reservation.is_replacement())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn clear_reservation(&self, key: &NonceKey, nonce: u64) -> RelayerResult<()> {
        sqlx::query(
            "DELETE FROM nonce_reservations WHERE network = $1 AND account = $2 AND nonce = $3",
        )
        .bind(&key.network)
        .bind(format!("{:?}", key.account))
        .bind(nonce as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn reservations(&self) -> RelayerResult<Vec<(NonceKey, u64)>> {
        let rows = sqlx::query("SELECT network, account, nonce FROM nonce_reservations")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> RelayerResult<(NonceKey, u64)> {
                let account: String = row.try_get("account")?;
                Ok((
                    NonceKey::new(parse_address("account", &account)?, row.try_get::<String, _>("network")?),
                    row.try_get::<i64, _>("nonce")? as u64,
                ))
            })
            .collect()
    }

    async fn health_check(&self) -> RelayerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
