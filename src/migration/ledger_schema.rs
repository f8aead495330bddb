//! The ledger's own schema.
//!
//! Every table is keyed by `store_id` so several stores can share one
//! database. The movement table rejects `UPDATE` and `DELETE` outright.

use super::{Migration, SqlMigration};

const CREATE_STOCK_RECORDS: &[&str] = &[r#"
    CREATE TABLE IF NOT EXISTS stock_records (
        store_id TEXT NOT NULL,
        product_id TEXT NOT NULL,
        quantity_on_hand BIGINT NOT NULL CHECK (quantity_on_hand >= 0),
        low_stock_threshold BIGINT NOT NULL CHECK (low_stock_threshold >= 0),
        version BIGINT NOT NULL CHECK (version >= 0),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (store_id, product_id)
    )
    "#];

const CREATE_STOCK_MOVEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS stock_movements (
        id BIGSERIAL PRIMARY KEY,
        store_id TEXT NOT NULL,
        product_id TEXT NOT NULL,
        movement_type TEXT NOT NULL
            CHECK (movement_type IN ('STOCK_IN', 'STOCK_OUT', 'ADJUSTMENT', 'SALE')),
        quantity_delta BIGINT NOT NULL CHECK (quantity_delta <> 0),
        previous_qty BIGINT NOT NULL CHECK (previous_qty >= 0),
        new_qty BIGINT NOT NULL CHECK (new_qty >= 0),
        reason TEXT,
        actor TEXT,
        version BIGINT NOT NULL CHECK (version >= 1),
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        CHECK (new_qty = previous_qty + quantity_delta),
        CHECK (movement_type <> 'ADJUSTMENT' OR reason IS NOT NULL),
        UNIQUE (store_id, product_id, version),
        FOREIGN KEY (store_id, product_id) REFERENCES stock_records (store_id, product_id)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_stock_movements_product
        ON stock_movements (store_id, product_id, id DESC)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_stock_movements_recent
        ON stock_movements (store_id, id DESC)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_stock_movements_type
        ON stock_movements (store_id, movement_type, id DESC)
    "#,
];

const APPEND_ONLY_MOVEMENTS: &[&str] = &[
    r#"
    CREATE OR REPLACE FUNCTION stock_movements_reject_mutation() RETURNS trigger AS $$
    BEGIN
        RAISE EXCEPTION 'stock_movements is append-only';
    END;
    $$ LANGUAGE plpgsql
    "#,
    "DROP TRIGGER IF EXISTS stock_movements_append_only ON stock_movements",
    r#"
    CREATE TRIGGER stock_movements_append_only
        BEFORE UPDATE OR DELETE ON stock_movements
        FOR EACH ROW EXECUTE FUNCTION stock_movements_reject_mutation()
    "#,
];

const LOW_STOCK_INDEX: &[&str] = &[r#"
    CREATE INDEX IF NOT EXISTS idx_stock_records_quantity
        ON stock_records (store_id, quantity_on_hand)
    "#];

/// Migrations creating the ledger tables, in version order
pub fn ledger_migrations() -> Vec<Box<dyn Migration>> {
    vec![
        Box::new(SqlMigration::new(
            20250101000001,
            "create_stock_records",
            CREATE_STOCK_RECORDS,
        )),
        Box::new(SqlMigration::new(
            20250101000002,
            "create_stock_movements",
            CREATE_STOCK_MOVEMENTS,
        )),
        Box::new(SqlMigration::new(
            20250101000003,
            "append_only_stock_movements",
            APPEND_ONLY_MOVEMENTS,
        )),
        Box::new(SqlMigration::new(
            20250214000001,
            "index_stock_records_quantity",
            LOW_STOCK_INDEX,
        )),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::Migrator;

    #[test]
    fn test_ledger_migrations_register_cleanly() {
        let migrator = Migrator::new(ledger_migrations()).unwrap();
        assert_eq!(migrator.migrations().len(), 4);
        assert_eq!(migrator.migrations()[0].name(), "create_stock_records");
    }

    #[test]
    fn test_movements_table_is_guarded() {
        let ddl = CREATE_STOCK_MOVEMENTS.join("\n");
        assert!(ddl.contains("new_qty = previous_qty + quantity_delta"));
        assert!(ddl.contains("quantity_delta <> 0"));
        assert!(APPEND_ONLY_MOVEMENTS
            .iter()
            .any(|s| s.contains("BEFORE UPDATE OR DELETE")));
    }
}
