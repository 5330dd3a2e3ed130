//! PostgreSQL ledger
//!
//! One database transaction per pass. Dropping an uncommitted transaction
//! (for example when shutdown aborts a cycle) rolls it back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::{scale_into, Ledger, LoggedDiscrepancy, PassCommit, PositionQuery};
use crate::domain::{
    EntryFill, OrderKind, OrderStatus, Position, PositionStatus, ProtectionStatus, ProtectiveOrder,
    Side, Trigger, Venue,
};
use crate::error::{Result, WardenError};
use crate::reconciliation::{Discrepancy, DiscrepancyKind, ReconcileAction};

const POSITION_COLUMNS: &str = "id, venue, symbol, side, quantity, entry_price, mark_price, \
     leverage, opened_at, status, closed_at, protection_status, last_synced_at";

const ORDER_COLUMNS: &str = "id, position_id, kind, trigger_type, trigger_price, activation_price, \
     callback_rate, quantity, venue_order_id, idempotency_key, status, reject_reason, created_at, updated_at";

fn ledger_write(err: sqlx::Error) -> WardenError {
    WardenError::LedgerWrite(err.to_string())
}

#[derive(Clone)]
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL ledger");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn insert_position(tx: &mut Transaction<'_, Postgres>, p: &Position) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO positions (id, venue, symbol, side, quantity, entry_price, mark_price,
                leverage, opened_at, status, closed_at, protection_status, last_synced_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(p.id)
        .bind(p.venue.as_str())
        .bind(&p.symbol)
        .bind(p.side.as_str())
        .bind(p.quantity)
        .bind(p.entry_price)
        .bind(p.mark_price)
        .bind(p.leverage as i32)
        .bind(p.opened_at)
        .bind(p.status.as_str())
        .bind(p.closed_at)
        .bind(p.protection_status.as_str())
        .bind(p.last_synced_at)
        .execute(&mut **tx)
        .await
        .map_err(ledger_write)?;
        Ok(())
    }

    /// Update an OPEN row; zero rows affected means the pass raced a change
    fn expect_one(rows: u64, position_id: Uuid, action: &str) -> Result<()> {
        if rows == 1 {
            Ok(())
        } else {
            Err(WardenError::LedgerWrite(format!(
                "{} affected {} rows for position {}",
                action, rows, position_id
            )))
        }
    }

    async fn apply_action(
        tx: &mut Transaction<'_, Postgres>,
        action: &ReconcileAction,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match action {
            ReconcileAction::CreateLocal { position } => Self::insert_position(tx, position).await,
            ReconcileAction::CloseLocal {
                position_id,
                closed_at,
                ..
            } => {
                let rows = sqlx::query(
                    r#"
                    UPDATE positions SET status = 'CLOSED', closed_at = $2, last_synced_at = $3
                    WHERE id = $1 AND status = 'OPEN'
                    "#,
                )
                .bind(position_id)
                .bind(closed_at)
                .bind(now)
                .execute(&mut **tx)
                .await
                .map_err(ledger_write)?
                .rows_affected();
                Self::expect_one(rows, *position_id, "CLOSE_LOCAL")
            }
            ReconcileAction::UpdateLocal {
                position_id,
                quantity,
                entry_price,
                mark_price,
                leverage,
                ..
            } => {
                let rows = sqlx::query(
                    r#"
                    UPDATE positions SET quantity = $2, entry_price = $3, mark_price = $4,
                        leverage = $5, last_synced_at = $6
                    WHERE id = $1 AND status = 'OPEN'
                    "#,
                )
                .bind(position_id)
                .bind(quantity)
                .bind(entry_price)
                .bind(mark_price)
                .bind(*leverage as i32)
                .bind(now)
                .execute(&mut **tx)
                .await
                .map_err(ledger_write)?
                .rows_affected();
                Self::expect_one(rows, *position_id, "UPDATE_LOCAL")
            }
        }
    }

    async fn upsert_order(tx: &mut Transaction<'_, Postgres>, order: &ProtectiveOrder) -> Result<()> {
        let (trigger_type, trigger_price, activation_price, callback_rate) = match order.trigger {
            Trigger::Fixed { trigger_price } => ("fixed", Some(trigger_price), None, None),
            Trigger::Trailing {
                activation_price,
                callback_rate,
            } => ("trailing", None, Some(activation_price), Some(callback_rate)),
        };

        sqlx::query(
            r#"
            INSERT INTO protective_orders (id, position_id, kind, trigger_type, trigger_price,
                activation_price, callback_rate, quantity, venue_order_id, idempotency_key,
                status, reject_reason, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO UPDATE SET
                trigger_type = EXCLUDED.trigger_type,
                trigger_price = EXCLUDED.trigger_price,
                activation_price = EXCLUDED.activation_price,
                callback_rate = EXCLUDED.callback_rate,
                quantity = EXCLUDED.quantity,
                venue_order_id = EXCLUDED.venue_order_id,
                status = EXCLUDED.status,
                reject_reason = EXCLUDED.reject_reason,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(order.id)
        .bind(order.position_id)
        .bind(order.kind.as_str())
        .bind(trigger_type)
        .bind(trigger_price)
        .bind(activation_price)
        .bind(callback_rate)
        .bind(order.quantity)
        .bind(&order.venue_order_id)
        .bind(&order.idempotency_key)
        .bind(order.status.as_str())
        .bind(&order.reject_reason)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(ledger_write)?;
        Ok(())
    }
}

fn position_from_row(row: &PgRow) -> Result<Position> {
    let venue: String = row.try_get("venue")?;
    let side: String = row.try_get("side")?;
    let status: String = row.try_get("status")?;
    let protection: String = row.try_get("protection_status")?;
    let leverage: i32 = row.try_get("leverage")?;

    Ok(Position {
        id: row.try_get("id")?,
        venue: venue.parse()?,
        symbol: row.try_get("symbol")?,
        side: Side::try_from(side.as_str())?,
        quantity: row.try_get("quantity")?,
        entry_price: row.try_get("entry_price")?,
        mark_price: row.try_get("mark_price")?,
        leverage: leverage.max(0) as u32,
        opened_at: row.try_get("opened_at")?,
        status: PositionStatus::try_from(status.as_str())?,
        closed_at: row.try_get("closed_at")?,
        protection_status: ProtectionStatus::try_from(protection.as_str())?,
        last_synced_at: row.try_get("last_synced_at")?,
    })
}

fn order_from_row(row: &PgRow) -> Result<ProtectiveOrder> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    let trigger_type: String = row.try_get("trigger_type")?;
    let trigger_price: Option<Decimal> = row.try_get("trigger_price")?;
    let activation_price: Option<Decimal> = row.try_get("activation_price")?;
    let callback_rate: Option<Decimal> = row.try_get("callback_rate")?;

    let trigger = match (trigger_type.as_str(), trigger_price, activation_price, callback_rate) {
        ("fixed", Some(trigger_price), _, _) => Trigger::Fixed { trigger_price },
        ("trailing", _, Some(activation_price), Some(callback_rate)) => Trigger::Trailing {
            activation_price,
            callback_rate,
        },
        (other, ..) => {
            return Err(WardenError::InvalidState(format!(
                "malformed trigger '{}' on order row",
                other
            )))
        }
    };

    Ok(ProtectiveOrder {
        id: row.try_get("id")?,
        position_id: row.try_get("position_id")?,
        kind: OrderKind::try_from(kind.as_str())?,
        trigger,
        quantity: row.try_get("quantity")?,
        venue_order_id: row.try_get("venue_order_id")?,
        idempotency_key: row.try_get("idempotency_key")?,
        status: OrderStatus::try_from(status.as_str())?,
        reject_reason: row.try_get("reject_reason")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl Ledger for PostgresLedger {
    async fn open_positions(&self, venue: Venue) -> Result<Vec<Position>> {
        self.positions(PositionQuery::open().venue(venue)).await
    }

    #[instrument(skip(self))]
    async fn positions(&self, query: PositionQuery) -> Result<Vec<Position>> {
        let sql = format!(
            "SELECT {} FROM positions \
             WHERE ($1::TEXT IS NULL OR venue = $1) AND ($2 OR status = 'OPEN') \
             ORDER BY venue, symbol, side, opened_at",
            POSITION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(query.venue.map(|v| v.as_str()))
            .bind(query.include_closed)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(position_from_row).collect()
    }

    async fn orders_for(&self, position_ids: &[Uuid]) -> Result<Vec<ProtectiveOrder>> {
        if position_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM protective_orders WHERE position_id = ANY($1) ORDER BY created_at",
            ORDER_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(position_ids)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(order_from_row).collect()
    }

    #[instrument(skip(self, entry), fields(venue = %entry.venue, symbol = %entry.symbol))]
    async fn record_entry(&self, entry: &EntryFill, now: DateTime<Utc>) -> Result<Position> {
        let fresh = Position::from_entry(entry, now)?;
        let mut tx = self.pool.begin().await.map_err(ledger_write)?;

        let sql = format!(
            "SELECT {} FROM positions WHERE venue = $1 AND symbol = $2 AND side = $3 \
             AND status = 'OPEN' FOR UPDATE",
            POSITION_COLUMNS
        );
        let existing = sqlx::query(&sql)
            .bind(entry.venue.as_str())
            .bind(&entry.symbol)
            .bind(entry.side.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(ledger_write)?;

        let position = match existing {
            Some(row) => {
                let mut position = position_from_row(&row)?;
                scale_into(&mut position, entry, now);
                sqlx::query(
                    r#"
                    UPDATE positions SET quantity = $2, entry_price = $3, leverage = $4,
                        last_synced_at = $5
                    WHERE id = $1
                    "#,
                )
                .bind(position.id)
                .bind(position.quantity)
                .bind(position.entry_price)
                .bind(position.leverage as i32)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(ledger_write)?;
                position
            }
            None => {
                Self::insert_position(&mut tx, &fresh).await?;
                fresh
            }
        };

        tx.commit().await.map_err(ledger_write)?;
        Ok(position)
    }

    #[instrument(skip(self, commit), fields(venue = %commit.venue, pass_id = %commit.pass_id))]
    async fn commit_pass(&self, commit: &PassCommit) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(ledger_write)?;
        let now = commit.committed_at;

        for action in &commit.actions {
            Self::apply_action(&mut tx, action, now).await?;
        }

        if !commit.synced.is_empty() {
            sqlx::query("UPDATE positions SET last_synced_at = $2 WHERE id = ANY($1)")
                .bind(&commit.synced)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(ledger_write)?;
        }

        for update in &commit.protection {
            sqlx::query("UPDATE positions SET protection_status = $2 WHERE id = $1")
                .bind(update.position_id)
                .bind(update.status.as_str())
                .execute(&mut *tx)
                .await
                .map_err(ledger_write)?;
        }

        for order in &commit.orders {
            Self::upsert_order(&mut tx, order).await?;
        }

        for d in &commit.discrepancies {
            sqlx::query(
                r#"
                INSERT INTO discrepancy_log (pass_id, venue, symbol, side, kind, local_value,
                    remote_value, detected_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(commit.pass_id)
            .bind(d.key.venue.as_str())
            .bind(&d.key.symbol)
            .bind(d.key.side.as_str())
            .bind(d.kind.as_str())
            .bind(d.local_value)
            .bind(d.remote_value)
            .bind(d.detected_at)
            .execute(&mut *tx)
            .await
            .map_err(ledger_write)?;
        }

        tx.commit().await.map_err(ledger_write)?;
        debug!(
            actions = commit.actions.len(),
            orders = commit.orders.len(),
            "Pass committed"
        );
        Ok(())
    }

    async fn recent_discrepancies(&self, limit: usize) -> Result<Vec<LoggedDiscrepancy>> {
        let rows = sqlx::query(
            r#"
            SELECT pass_id, venue, symbol, side, kind, local_value, remote_value, detected_at
            FROM discrepancy_log
            ORDER BY detected_at DESC, id DESC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let venue: String = row.try_get("venue")?;
                let side: String = row.try_get("side")?;
                let kind: String = row.try_get("kind")?;
                Ok(LoggedDiscrepancy {
                    pass_id: row.try_get("pass_id")?,
                    discrepancy: Discrepancy {
                        kind: DiscrepancyKind::try_from(kind.as_str())?,
                        key: crate::domain::PositionKey::new(
                            venue.parse::<Venue>()?,
                            row.try_get::<String, _>("symbol")?,
                            Side::try_from(side.as_str())?,
                        ),
                        local_value: row.try_get("local_value")?,
                        remote_value: row.try_get("remote_value")?,
                        detected_at: row.try_get("detected_at")?,
                    },
                })
            })
            .collect()
    }
}
