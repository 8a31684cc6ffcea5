//! Database schema migrations

use crate::{Error, Result};
use rusqlite::Connection;

const SCHEMA_VERSION: i32 = 4;

/// Run all migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    tracing::debug!(
        "Running migrations: current_version={}, target_version={}",
        current_version,
        SCHEMA_VERSION
    );

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    if current_version < 2 {
        migrate_v2(conn)?;
    }

    if current_version < 3 {
        migrate_v3(conn)?;
    }

    if current_version < 4 {
        migrate_v4(conn)?;
    }

    if current_version != SCHEMA_VERSION {
        set_schema_version(conn, SCHEMA_VERSION)?;
    }

    Ok(())
}

/// Current schema version (0 for an empty database)
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    let result = conn.query_row(
        "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
        [],
        |row| row.get(0),
    );

    match result {
        Ok(v) => Ok(v),
        Err(_) => Ok(0),
    }
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
        [],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    tracing::debug!("Schema version set to {}", version);
    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE store_meta (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            digest_seed INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE wallet_accounts (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            network_id INTEGER NOT NULL,
            kind TEXT NOT NULL CHECK (kind IN ('utxo', 'utxo_and_accounting')),
            created_at INTEGER NOT NULL
        );

        CREATE TABLE addresses (
            id INTEGER PRIMARY KEY,
            digest INTEGER NOT NULL,
            hash TEXT NOT NULL,
            address_type INTEGER NOT NULL,
            is_used BOOLEAN NOT NULL DEFAULT 0
        );

        CREATE TABLE account_addresses (
            account_id INTEGER NOT NULL,
            address_id INTEGER NOT NULL,
            PRIMARY KEY (account_id, address_id),
            FOREIGN KEY (account_id) REFERENCES wallet_accounts(id) ON DELETE CASCADE,
            FOREIGN KEY (address_id) REFERENCES addresses(id) ON DELETE CASCADE
        );

        CREATE TABLE blocks (
            id INTEGER PRIMARY KEY,
            network_id INTEGER NOT NULL,
            digest INTEGER NOT NULL,
            hash TEXT NOT NULL,
            height INTEGER NOT NULL,
            slot INTEGER NOT NULL,
            block_time INTEGER NOT NULL
        );

        CREATE TABLE transactions (
            id INTEGER PRIMARY KEY,
            network_id INTEGER NOT NULL,
            digest INTEGER NOT NULL,
            hash TEXT NOT NULL,
            block_id INTEGER,
            ordinal INTEGER,
            status INTEGER NOT NULL,
            last_update INTEGER NOT NULL,
            error_message TEXT,
            extra TEXT,
            FOREIGN KEY (block_id) REFERENCES blocks(id)
        );

        CREATE TABLE utxo_inputs (
            id INTEGER PRIMARY KEY,
            transaction_id INTEGER NOT NULL,
            address_id INTEGER NOT NULL,
            parent_tx_hash TEXT NOT NULL,
            parent_tx_digest INTEGER NOT NULL,
            parent_index INTEGER NOT NULL,
            input_index INTEGER NOT NULL,
            token_list_id INTEGER NOT NULL,
            FOREIGN KEY (transaction_id) REFERENCES transactions(id) ON DELETE CASCADE,
            FOREIGN KEY (address_id) REFERENCES addresses(id) ON DELETE CASCADE
        );

        CREATE TABLE utxo_outputs (
            id INTEGER PRIMARY KEY,
            transaction_id INTEGER NOT NULL,
            address_id INTEGER NOT NULL,
            output_index INTEGER NOT NULL,
            is_unspent BOOLEAN NOT NULL DEFAULT 1,
            token_list_id INTEGER NOT NULL,
            UNIQUE (transaction_id, output_index),
            FOREIGN KEY (transaction_id) REFERENCES transactions(id) ON DELETE CASCADE,
            FOREIGN KEY (address_id) REFERENCES addresses(id) ON DELETE CASCADE
        );

        CREATE TABLE accounting_inputs (
            id INTEGER PRIMARY KEY,
            transaction_id INTEGER NOT NULL,
            address_id INTEGER NOT NULL,
            spending_counter INTEGER NOT NULL,
            input_index INTEGER NOT NULL,
            token_list_id INTEGER NOT NULL,
            FOREIGN KEY (transaction_id) REFERENCES transactions(id) ON DELETE CASCADE,
            FOREIGN KEY (address_id) REFERENCES addresses(id) ON DELETE CASCADE
        );

        CREATE INDEX idx_addresses_digest ON addresses(digest);
        CREATE INDEX idx_account_addresses_address ON account_addresses(address_id);
        CREATE INDEX idx_blocks_digest ON blocks(network_id, digest);
        CREATE INDEX idx_blocks_height ON blocks(height);
        CREATE INDEX idx_transactions_digest ON transactions(network_id, digest);
        CREATE INDEX idx_transactions_block ON transactions(block_id);
        CREATE INDEX idx_transactions_status ON transactions(status);
        CREATE INDEX idx_utxo_inputs_tx ON utxo_inputs(transaction_id);
        CREATE INDEX idx_utxo_inputs_address ON utxo_inputs(address_id);
        CREATE INDEX idx_utxo_inputs_parent ON utxo_inputs(parent_tx_digest, parent_index);
        CREATE INDEX idx_utxo_outputs_address ON utxo_outputs(address_id);
        CREATE INDEX idx_utxo_outputs_unspent ON utxo_outputs(is_unspent);
        CREATE INDEX idx_accounting_inputs_tx ON accounting_inputs(transaction_id);
        CREATE INDEX idx_accounting_inputs_address ON accounting_inputs(address_id);
        "#,
    )
    .map_err(|e| Error::Migration(e.to_string()))?;

    Ok(())
}

fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Multi-asset catalog. The primary asset uses the empty identifier.
        -- Long identifiers are only reachable through their digest.
        CREATE TABLE tokens (
            id INTEGER PRIMARY KEY,
            network_id INTEGER NOT NULL,
            digest INTEGER NOT NULL,
            identifier TEXT NOT NULL,
            is_default BOOLEAN NOT NULL DEFAULT 0,
            is_nft BOOLEAN NOT NULL DEFAULT 0,
            metadata TEXT NOT NULL,
            last_updated INTEGER
        );

        -- Ordered (token, amount) multiset shared by one input or output via list_id.
        CREATE TABLE token_lists (
            id INTEGER PRIMARY KEY,
            list_id INTEGER NOT NULL,
            token_id INTEGER NOT NULL,
            amount TEXT NOT NULL,
            FOREIGN KEY (token_id) REFERENCES tokens(id) ON DELETE CASCADE
        );

        CREATE INDEX idx_tokens_digest ON tokens(network_id, digest);
        CREATE INDEX idx_token_lists_list ON token_lists(list_id);
        CREATE INDEX idx_token_lists_token ON token_lists(token_id);
        "#,
    )
    .map_err(|e| Error::Migration(e.to_string()))?;

    Ok(())
}

fn migrate_v3(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE certificates (
            id INTEGER PRIMARY KEY,
            transaction_id INTEGER NOT NULL,
            ordinal INTEGER NOT NULL,
            kind INTEGER NOT NULL,
            payload TEXT NOT NULL,
            FOREIGN KEY (transaction_id) REFERENCES transactions(id) ON DELETE CASCADE
        );

        CREATE TABLE certificate_addresses (
            id INTEGER PRIMARY KEY,
            certificate_id INTEGER NOT NULL,
            address_id INTEGER NOT NULL,
            relation INTEGER NOT NULL,
            FOREIGN KEY (certificate_id) REFERENCES certificates(id) ON DELETE CASCADE,
            FOREIGN KEY (address_id) REFERENCES addresses(id) ON DELETE CASCADE
        );

        CREATE INDEX idx_certificates_tx ON certificates(transaction_id);
        CREATE INDEX idx_certificate_addresses_cert ON certificate_addresses(certificate_id);
        CREATE INDEX idx_certificate_addresses_address ON certificate_addresses(address_id);
        "#,
    )
    .map_err(|e| Error::Migration(e.to_string()))?;

    Ok(())
}

fn migrate_v4(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Rollback anchor, one row per account
        CREATE TABLE last_sync_info (
            account_id INTEGER PRIMARY KEY,
            block_hash TEXT,
            height INTEGER NOT NULL DEFAULT 0,
            slot INTEGER,
            block_time INTEGER,
            updated_at TEXT NOT NULL,
            FOREIGN KEY (account_id) REFERENCES wallet_accounts(id) ON DELETE CASCADE
        );

        -- Full UTXO set as of a final block
        CREATE TABLE utxo_at_safe_point (
            account_id INTEGER PRIMARY KEY,
            block_hash TEXT NOT NULL,
            block_height INTEGER NOT NULL,
            address_set_hash TEXT NOT NULL,
            utxos TEXT NOT NULL,
            FOREIGN KEY (account_id) REFERENCES wallet_accounts(id) ON DELETE CASCADE
        );

        -- Incremental diffs layered on top of the safe point
        CREATE TABLE utxo_diff_to_best_block (
            id INTEGER PRIMARY KEY,
            account_id INTEGER NOT NULL,
            last_best_block_hash TEXT NOT NULL,
            block_height INTEGER NOT NULL,
            spent_utxo_ids TEXT NOT NULL,
            new_utxos TEXT NOT NULL,
            UNIQUE (account_id, last_best_block_hash),
            FOREIGN KEY (account_id) REFERENCES wallet_accounts(id) ON DELETE CASCADE
        );

        CREATE INDEX idx_utxo_diff_account ON utxo_diff_to_best_block(account_id, id);
        "#,
    )
    .map_err(|e| Error::Migration(e.to_string()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_version() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), 0);
        run_migrations(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_every_registered_table_exists() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        for table in crate::schema::Table::ALL {
            let exists: bool = conn
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
                    [table.name()],
                    |row| row.get(0),
                )
                .unwrap();
            assert!(exists, "missing table {}", table);
        }
    }
}
