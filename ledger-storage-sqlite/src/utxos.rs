//! UTXO inputs, outputs and withdrawals
//!
//! Inputs reference the output they consume by (parent hash, index) rather
//! than by foreign key: the parent transaction may arrive later, or never if
//! it belongs to someone else.

use crate::models::{
    AccountingInputRow, AddressId, NewAccountingInput, NewUtxoInput, NewUtxoOutput, TransactionId,
    TxStatus, UtxoInputRow, UtxoOutputRow,
};
use crate::schema::{placeholders, ScopedTx, Table, PARAM_CHUNK};
use crate::Result;
use rusqlite::{params, params_from_iter};
use std::collections::{HashMap, HashSet};

/// UTXO operations inside a scoped transaction
pub struct UtxoStore<'a> {
    tx: &'a ScopedTx<'a>,
}

impl<'a> UtxoStore<'a> {
    /// Tables touched
    pub const TABLES: &'static [Table] = &[
        Table::UtxoInput,
        Table::UtxoOutput,
        Table::AccountingInput,
        Table::Transaction,
    ];

    /// Bind to `tx`
    pub fn new(tx: &'a ScopedTx<'a>) -> Result<Self> {
        tx.ensure(Self::TABLES)?;
        Ok(Self { tx })
    }

    /// Insert an input of `transaction_id`
    pub fn insert_input(&self, transaction_id: TransactionId, input: &NewUtxoInput) -> Result<i64> {
        self.tx.require_write()?;
        self.tx.execute(
            r#"
            INSERT INTO utxo_inputs
                (transaction_id, address_id, parent_tx_hash, parent_tx_digest, parent_index,
                 input_index, token_list_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                transaction_id,
                input.address_id,
                input.parent_tx_hash,
                self.tx.digest(&input.parent_tx_hash),
                input.parent_index,
                input.input_index,
                input.token_list_id
            ],
        )?;
        Ok(self.tx.last_insert_rowid())
    }

    /// Insert an output of the transaction `transaction_id` with hash `tx_hash`.
    ///
    /// The output starts spent when a live stored input already consumes it.
    /// Returns the row id and the initial unspent flag.
    pub fn insert_output(
        &self,
        transaction_id: TransactionId,
        tx_hash: &str,
        output: &NewUtxoOutput,
    ) -> Result<(i64, bool)> {
        self.tx.require_write()?;
        let consumed: bool = self.tx.query_row(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM utxo_inputs i JOIN transactions t ON t.id = i.transaction_id
                WHERE i.parent_tx_digest = ?1 AND i.parent_tx_hash = ?2 AND i.parent_index = ?3
                  AND t.status IN (?4, ?5)
            )
            "#,
            params![
                self.tx.digest(tx_hash),
                tx_hash,
                output.output_index,
                TxStatus::Pending.code(),
                TxStatus::InBlock.code()
            ],
            |row| row.get(0),
        )?;
        let is_unspent = !consumed;
        self.tx.execute(
            r#"
            INSERT INTO utxo_outputs (transaction_id, address_id, output_index, is_unspent, token_list_id)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                transaction_id,
                output.address_id,
                output.output_index,
                is_unspent,
                output.token_list_id
            ],
        )?;
        Ok((self.tx.last_insert_rowid(), is_unspent))
    }

    /// Insert a withdrawal of `transaction_id`
    pub fn insert_accounting_input(
        &self,
        transaction_id: TransactionId,
        input: &NewAccountingInput,
    ) -> Result<i64> {
        self.tx.require_write()?;
        self.tx.execute(
            r#"
            INSERT INTO accounting_inputs
                (transaction_id, address_id, spending_counter, input_index, token_list_id)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                transaction_id,
                input.address_id,
                input.spending_counter as i64,
                input.input_index,
                input.token_list_id
            ],
        )?;
        Ok(self.tx.last_insert_rowid())
    }

    /// Number of withdrawals stored for `address_id`; seeds the synthetic
    /// spending counter of the next one
    pub fn accounting_count(&self, address_id: AddressId) -> Result<u64> {
        let count: i64 = self.tx.query_row(
            "SELECT COUNT(*) FROM accounting_inputs WHERE address_id = ?1",
            [address_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Inputs of `transaction_ids`
    pub fn inputs_of(&self, transaction_ids: &[TransactionId]) -> Result<Vec<UtxoInputRow>> {
        let mut out = Vec::new();
        for chunk in transaction_ids.chunks(PARAM_CHUNK) {
            let sql = format!(
                r#"
                SELECT id, transaction_id, address_id, parent_tx_hash, parent_index, input_index, token_list_id
                FROM utxo_inputs WHERE transaction_id IN ({}) ORDER BY transaction_id, input_index
                "#,
                placeholders(chunk.len())
            );
            let mut stmt = self.tx.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                Ok(UtxoInputRow {
                    id: row.get(0)?,
                    transaction_id: row.get(1)?,
                    input: NewUtxoInput {
                        address_id: row.get(2)?,
                        parent_tx_hash: row.get(3)?,
                        parent_index: row.get(4)?,
                        input_index: row.get(5)?,
                        token_list_id: row.get(6)?,
                    },
                })
            })?;
            for row in rows {
                out.push(row?);
            }
        }
        Ok(out)
    }

    /// Outputs of `transaction_ids`
    pub fn outputs_of(&self, transaction_ids: &[TransactionId]) -> Result<Vec<UtxoOutputRow>> {
        let mut out = Vec::new();
        for chunk in transaction_ids.chunks(PARAM_CHUNK) {
            let sql = format!(
                r#"
                SELECT id, transaction_id, address_id, output_index, token_list_id, is_unspent
                FROM utxo_outputs WHERE transaction_id IN ({}) ORDER BY transaction_id, output_index
                "#,
                placeholders(chunk.len())
            );
            let mut stmt = self.tx.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                Ok(UtxoOutputRow {
                    id: row.get(0)?,
                    transaction_id: row.get(1)?,
                    output: NewUtxoOutput {
                        address_id: row.get(2)?,
                        output_index: row.get(3)?,
                        token_list_id: row.get(4)?,
                    },
                    is_unspent: row.get(5)?,
                })
            })?;
            for row in rows {
                out.push(row?);
            }
        }
        Ok(out)
    }

    /// Withdrawals of `transaction_ids`
    pub fn accounting_inputs_of(
        &self,
        transaction_ids: &[TransactionId],
    ) -> Result<Vec<AccountingInputRow>> {
        let mut out = Vec::new();
        for chunk in transaction_ids.chunks(PARAM_CHUNK) {
            let sql = format!(
                r#"
                SELECT id, transaction_id, address_id, spending_counter, input_index, token_list_id
                FROM accounting_inputs WHERE transaction_id IN ({}) ORDER BY transaction_id, input_index
                "#,
                placeholders(chunk.len())
            );
            let mut stmt = self.tx.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                Ok(AccountingInputRow {
                    id: row.get(0)?,
                    transaction_id: row.get(1)?,
                    input: NewAccountingInput {
                        address_id: row.get(2)?,
                        spending_counter: row.get::<_, i64>(3)? as u64,
                        input_index: row.get(4)?,
                        token_list_id: row.get(5)?,
                    },
                })
            })?;
            for row in rows {
                out.push(row?);
            }
        }
        Ok(out)
    }

    /// Mark spent the outputs consumed by the inputs of `spending`.
    ///
    /// Only outputs of transactions in `known` are touched; inputs consuming
    /// someone else's output are ignored. Returns the number of outputs
    /// that changed.
    pub fn mark_consumed_spent(
        &self,
        spending: &[TransactionId],
        known: &HashSet<TransactionId>,
    ) -> Result<usize> {
        self.set_consumed(spending, known, false)
    }

    /// Mark unspent again the outputs consumed by the inputs of `reverted`.
    ///
    /// `reverted` must already be in a dead status: an output still
    /// consumed by some other live input stays spent.
    pub fn mark_consumed_unspent(
        &self,
        reverted: &[TransactionId],
        known: &HashSet<TransactionId>,
    ) -> Result<usize> {
        self.set_consumed(reverted, known, true)
    }

    fn set_consumed(
        &self,
        spending: &[TransactionId],
        known: &HashSet<TransactionId>,
        unspent: bool,
    ) -> Result<usize> {
        self.tx.require_write()?;
        let inputs = self.inputs_of(spending)?;
        if inputs.is_empty() {
            return Ok(0);
        }
        let parents = self.resolve_parents(&inputs, known)?;

        let mut changed = 0;
        for input in &inputs {
            let Some(parent_id) = parents.get(&input.input.parent_tx_hash) else {
                continue;
            };
            changed += if unspent {
                self.tx.execute(
                    r#"
                    UPDATE utxo_outputs SET is_unspent = 1
                    WHERE transaction_id = ?1 AND output_index = ?2 AND is_unspent = 0
                      AND NOT EXISTS (
                        SELECT 1 FROM utxo_inputs i JOIN transactions t ON t.id = i.transaction_id
                        WHERE i.parent_tx_digest = ?3 AND i.parent_tx_hash = ?4
                          AND i.parent_index = ?2 AND t.status IN (?5, ?6)
                      )
                    "#,
                    params![
                        parent_id,
                        input.input.parent_index,
                        self.tx.digest(&input.input.parent_tx_hash),
                        input.input.parent_tx_hash,
                        TxStatus::Pending.code(),
                        TxStatus::InBlock.code()
                    ],
                )?
            } else {
                self.tx.execute(
                    r#"
                    UPDATE utxo_outputs SET is_unspent = 0
                    WHERE transaction_id = ?1 AND output_index = ?2 AND is_unspent = 1
                    "#,
                    params![parent_id, input.input.parent_index],
                )?
            };
        }
        tracing::debug!(
            inputs = inputs.len(),
            changed,
            unspent,
            "Updated consumed outputs"
        );
        Ok(changed)
    }

    /// Map parent hashes of `inputs` to transaction ids inside `known`
    fn resolve_parents(
        &self,
        inputs: &[UtxoInputRow],
        known: &HashSet<TransactionId>,
    ) -> Result<HashMap<String, TransactionId>> {
        let wanted: HashSet<&str> = inputs
            .iter()
            .map(|i| i.input.parent_tx_hash.as_str())
            .collect();
        let digests: Vec<i64> = wanted
            .iter()
            .map(|h| self.tx.digest(h))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        let mut out = HashMap::new();
        for chunk in digests.chunks(PARAM_CHUNK) {
            let sql = format!(
                "SELECT id, hash FROM transactions WHERE digest IN ({})",
                placeholders(chunk.len())
            );
            let mut stmt = self.tx.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                Ok((row.get::<_, TransactionId>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (id, hash) = row?;
                if known.contains(&id) && wanted.contains(hash.as_str()) {
                    out.insert(hash, id);
                }
            }
        }
        Ok(out)
    }
}
