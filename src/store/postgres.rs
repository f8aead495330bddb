//! PostgreSQL ledger backend.
//!
//! Rows are scoped by `store_id`. A commit runs inside one transaction:
//! lock the product row, check it still sits at the expected version,
//! `UPDATE ... WHERE version = $expected`, then `INSERT` the movement. Either
//! both rows change or neither does. The row lock lives only as long as that
//! transaction; nothing is held between adjustment attempts.

use crate::config::DatabaseConfig;
use crate::error::LedgerError;
use crate::executor::{column, PgExecutor, SqlExecutor};
use crate::migration::{ledger_migrations, Migrator};
use crate::model::{MovementRecord, NewMovement, OpenStock, ProductId, ProductStockRecord};
use crate::movement_log::{paginate, MovementFilter, MovementLog, MovementPage, PageRequest};
use crate::pool::ConnectionPool;
use crate::projector::QuantityProjector;
use crate::store::{check_commit, Committed, LedgerStore};
use crate::transaction::{IsolationLevel, Transaction};
use may_postgres::{Client, Row};

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

const SELECT_RECORD: &str = "SELECT product_id, quantity_on_hand, low_stock_threshold, version \
     FROM stock_records WHERE store_id = $1 AND product_id = $2";

const INSERT_MOVEMENT: &str = "INSERT INTO stock_movements \
     (store_id, product_id, movement_type, quantity_delta, previous_qty, new_qty, reason, actor, version) \
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
     RETURNING id, created_at";

/// Ledger backend persisted in PostgreSQL
pub struct PgStore {
    pool: ConnectionPool,
    store_id: String,
}

impl PgStore {
    /// Wrap an existing pool; the schema must already be migrated
    pub fn new(pool: ConnectionPool, store_id: impl Into<String>) -> Self {
        Self {
            pool,
            store_id: store_id.into(),
        }
    }

    /// Open a pool and bring the schema up to date
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Storage` or `LedgerError::Postgres` if the
    /// database is unreachable or a migration fails.
    pub fn connect(config: &DatabaseConfig, store_id: impl Into<String>) -> Result<Self, LedgerError> {
        let pool = ConnectionPool::connect(config)?;
        {
            let client = pool.acquire()?;
            let applied = Migrator::new(ledger_migrations())?.up(&client)?;
            if applied > 0 {
                log::info!("ledger schema migrated ({applied} migration(s) applied)");
            }
        }
        Ok(Self::new(pool, store_id))
    }

    pub fn store_id(&self) -> &str {
        &self.store_id
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    fn with_client<T>(
        &self,
        f: impl FnOnce(&Client) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let client = self.pool.acquire()?;
        f(&*client)
    }

    fn fetch_record(
        &self,
        executor: &dyn SqlExecutor,
        product_id: &ProductId,
        for_update: bool,
    ) -> Result<ProductStockRecord, LedgerError> {
        let query = if for_update {
            format!("{SELECT_RECORD} FOR UPDATE")
        } else {
            SELECT_RECORD.to_string()
        };
        let row = executor
            .query_opt(&query, &[&self.store_id, &product_id.as_str()])?
            .ok_or_else(|| LedgerError::not_found(product_id))?;
        record_from_row(&row)
    }

    fn insert_movement(
        &self,
        executor: &dyn SqlExecutor,
        movement: NewMovement,
    ) -> Result<MovementRecord, LedgerError> {
        let row = executor
            .query_opt(
                INSERT_MOVEMENT,
                &[
                    &self.store_id,
                    &movement.product_id.as_str(),
                    &movement.movement_type.as_str(),
                    &movement.quantity_delta,
                    &movement.previous_qty,
                    &movement.new_qty,
                    &movement.reason,
                    &movement.actor,
                    &movement.version,
                ],
            )?
            .ok_or_else(|| LedgerError::Storage("movement insert returned no row".into()))?;
        let id: i64 = column(&row, "id")?;
        let created_at = column(&row, "created_at")?;
        Ok(movement.into_record(id, created_at))
    }

    /// Compare-and-set on the stored version inside the caller's transaction
    ///
    /// Only [`LedgerStore::commit`] calls this, followed by the movement
    /// insert in the same transaction.
    fn apply_delta(
        &self,
        tx: &Transaction<'_>,
        product_id: &ProductId,
        delta: i64,
        expected_version: i64,
    ) -> Result<ProductStockRecord, LedgerError> {
        let updated = tx.query_opt(
            "UPDATE stock_records \
             SET quantity_on_hand = quantity_on_hand + $3, version = version + 1, updated_at = now() \
             WHERE store_id = $1 AND product_id = $2 AND version = $4 \
               AND quantity_on_hand + $3 >= 0 \
             RETURNING product_id, quantity_on_hand, low_stock_threshold, version",
            &[&self.store_id, &product_id.as_str(), &delta, &expected_version],
        )?;
        if let Some(row) = updated {
            return record_from_row(&row);
        }

        let current = self.fetch_record(tx, product_id, false)?;
        if current.version != expected_version {
            return Err(LedgerError::ConcurrentModification {
                product_id: product_id.clone(),
                expected_version,
                actual_version: current.version,
            });
        }
        Err(LedgerError::InsufficientStock {
            product_id: product_id.clone(),
            on_hand: current.quantity_on_hand,
            requested: delta.saturating_neg(),
        })
    }

    fn movements(
        &self,
        executor: &dyn SqlExecutor,
        product_id: &ProductId,
    ) -> Result<Vec<MovementRecord>, LedgerError> {
        executor
            .query_all(
                "SELECT id, product_id, movement_type, quantity_delta, previous_qty, new_qty, \
                        reason, actor, created_at, version \
                 FROM stock_movements WHERE store_id = $1 AND product_id = $2 \
                 ORDER BY version ASC",
                &[&self.store_id, &product_id.as_str()],
            )?
            .iter()
            .map(movement_from_row)
            .collect()
    }
}

fn record_from_row(row: &Row) -> Result<ProductStockRecord, LedgerError> {
    let product_id: String = column(row, "product_id")?;
    Ok(ProductStockRecord {
        product_id: ProductId::from(product_id),
        quantity_on_hand: column(row, "quantity_on_hand")?,
        low_stock_threshold: column(row, "low_stock_threshold")?,
        version: column(row, "version")?,
    })
}

fn movement_from_row(row: &Row) -> Result<MovementRecord, LedgerError> {
    let product_id: String = column(row, "product_id")?;
    let movement_type: String = column(row, "movement_type")?;
    Ok(MovementRecord {
        id: column(row, "id")?,
        product_id: ProductId::from(product_id),
        movement_type: movement_type.parse()?,
        quantity_delta: column(row, "quantity_delta")?,
        previous_qty: column(row, "previous_qty")?,
        new_qty: column(row, "new_qty")?,
        reason: column(row, "reason")?,
        actor: column(row, "actor")?,
        created_at: column(row, "created_at")?,
        version: column(row, "version")?,
    })
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

impl MovementLog for PgStore {
    fn list_by_product(
        &self,
        product_id: &ProductId,
        page: &PageRequest,
    ) -> Result<MovementPage, LedgerError> {
        self.with_client(|client| {
            let executor = PgExecutor::new(client);
            self.fetch_record(&executor, product_id, false)?;
            let before = page.cursor.map(|c| c.before_id());
            let rows = executor.query_all(
                "SELECT id, product_id, movement_type, quantity_delta, previous_qty, new_qty, \
                        reason, actor, created_at, version \
                 FROM stock_movements \
                 WHERE store_id = $1 AND product_id = $2 AND ($3::BIGINT IS NULL OR id < $3) \
                 ORDER BY id DESC LIMIT $4",
                &[
                    &self.store_id,
                    &product_id.as_str(),
                    &before,
                    &limit_param(page.limit.saturating_add(1)),
                ],
            )?;
            let movements = rows
                .iter()
                .map(movement_from_row)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(paginate(movements.iter(), page))
        })
    }

    fn list_recent(
        &self,
        limit: usize,
        filter: &MovementFilter,
    ) -> Result<Vec<MovementRecord>, LedgerError> {
        self.with_client(|client| {
            let executor = PgExecutor::new(client);
            if let Some(product_id) = &filter.product_id {
                self.fetch_record(&executor, product_id, false)?;
            }
            let product = filter.product_id.as_ref().map(|p| p.as_str());
            let movement_type = filter.movement_type.map(|t| t.as_str());
            executor
                .query_all(
                    "SELECT id, product_id, movement_type, quantity_delta, previous_qty, new_qty, \
                            reason, actor, created_at, version \
                     FROM stock_movements \
                     WHERE store_id = $1 \
                       AND ($2::TEXT IS NULL OR product_id = $2) \
                       AND ($3::TEXT IS NULL OR movement_type = $3) \
                     ORDER BY id DESC LIMIT $4",
                    &[&self.store_id, &product, &movement_type, &limit_param(limit)],
                )?
                .iter()
                .map(movement_from_row)
                .collect()
        })
    }

    fn replay(&self, product_id: &ProductId) -> Result<Vec<MovementRecord>, LedgerError> {
        self.with_client(|client| {
            let executor = PgExecutor::new(client);
            self.fetch_record(&executor, product_id, false)?;
            self.movements(&executor, product_id)
        })
    }
}

impl QuantityProjector for PgStore {
    fn get_current(&self, product_id: &ProductId) -> Result<ProductStockRecord, LedgerError> {
        self.with_client(|client| self.fetch_record(&PgExecutor::new(client), product_id, false))
    }

    fn initialize(&self, request: &OpenStock) -> Result<ProductStockRecord, LedgerError> {
        request.validate()?;
        let opening = request.opening_movement();
        if let Some(movement) = &opening {
            movement.validate()?;
        }
        let (quantity, version) = opening
            .as_ref()
            .map_or((0, 0), |m| (m.new_qty, m.version));

        self.with_client(|client| {
            let tx = Transaction::begin(client)?;
            let inserted = tx.query_opt(
                "INSERT INTO stock_records \
                 (store_id, product_id, quantity_on_hand, low_stock_threshold, version) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (store_id, product_id) DO NOTHING \
                 RETURNING product_id, quantity_on_hand, low_stock_threshold, version",
                &[
                    &self.store_id,
                    &request.product_id.as_str(),
                    &quantity,
                    &request.low_stock_threshold,
                    &version,
                ],
            )?;
            let Some(row) = inserted else {
                return Err(LedgerError::AlreadyExists {
                    product_id: request.product_id.clone(),
                });
            };
            let record = record_from_row(&row)?;
            if let Some(movement) = opening {
                self.insert_movement(&tx, movement)?;
            }
            tx.commit()?;
            Ok(record)
        })
    }

    fn set_low_stock_threshold(
        &self,
        product_id: &ProductId,
        threshold: i64,
    ) -> Result<ProductStockRecord, LedgerError> {
        if threshold < 0 {
            return Err(LedgerError::validation(format!(
                "low stock threshold must not be negative, got {threshold}"
            )));
        }
        self.with_client(|client| {
            let row = PgExecutor::new(client)
                .query_opt(
                    "UPDATE stock_records SET low_stock_threshold = $3, updated_at = now() \
                     WHERE store_id = $1 AND product_id = $2 \
                     RETURNING product_id, quantity_on_hand, low_stock_threshold, version",
                    &[&self.store_id, &product_id.as_str(), &threshold],
                )?
                .ok_or_else(|| LedgerError::not_found(product_id))?;
            record_from_row(&row)
        })
    }

    fn snapshot(&self) -> Result<Vec<ProductStockRecord>, LedgerError> {
        self.with_client(|client| {
            PgExecutor::new(client)
                .query_all(
                    "SELECT product_id, quantity_on_hand, low_stock_threshold, version \
                     FROM stock_records WHERE store_id = $1 ORDER BY product_id",
                    &[&self.store_id],
                )?
                .iter()
                .map(record_from_row)
                .collect()
        })
    }
}

impl LedgerStore for PgStore {
    fn commit(
        &self,
        movement: NewMovement,
        expected_version: i64,
    ) -> Result<Committed, LedgerError> {
        #[cfg(feature = "tracing")]
        let _span =
            tracing_helpers::commit_span(movement.product_id.as_str(), expected_version).entered();

        movement.validate()?;
        self.with_client(|client| {
            let tx = Transaction::begin(client)?;
            let current = self.fetch_record(&tx, &movement.product_id, true)?;
            check_commit(&current, &movement, expected_version)?;

            let state = self.apply_delta(
                &tx,
                &movement.product_id,
                movement.quantity_delta,
                expected_version,
            )?;
            let movement = self.insert_movement(&tx, movement)?;
            tx.commit()?;
            Ok(Committed { movement, state })
        })
    }

    fn audit_view(
        &self,
        product_id: &ProductId,
    ) -> Result<(ProductStockRecord, Vec<MovementRecord>), LedgerError> {
        self.with_client(|client| {
            let tx = Transaction::begin_with_isolation(client, IsolationLevel::RepeatableRead)?;
            let record = self.fetch_record(&tx, product_id, false)?;
            let history = self.movements(&tx, product_id)?;
            tx.commit()?;
            Ok((record, history))
        })
    }
}
