//! Store-level tests across transactions, UTXOs, balances and destructive ops

use ledger_storage_sqlite::*;
use std::collections::HashSet;

const NETWORK: i64 = 1;

fn addr(n: u8) -> String {
    format!("61{}", hex::encode([n; 28]))
}

fn tx_hash(n: u8) -> String {
    hex::encode([n; 32])
}

fn all_locks() -> LockSet {
    LockSet::all()
}

struct Fixture {
    db: Database,
    account: AccountId,
}

impl Fixture {
    fn new() -> Self {
        let db = Database::open_in_memory().unwrap();
        ensure_default_token(&db, NETWORK).unwrap();
        let tx = db.write(LockSet::of(AccountStore::TABLES)).unwrap();
        let store = AccountStore::new(&tx).unwrap();
        let account = store.create("main", NETWORK, WalletKind::Utxo).unwrap().id;
        store.add_owned_addresses(account, &[addr(1), addr(2)]).unwrap();
        tx.commit().unwrap();
        Self { db, account }
    }

    /// Insert a confirmed transaction spending `inputs` and paying `outputs`
    fn insert(
        &self,
        hash: &str,
        height: u64,
        status: TxStatus,
        inputs: &[(String, u32, String)],
        outputs: &[(String, u128)],
    ) -> TransactionId {
        let tx = self.db.write(all_locks()).unwrap();
        let block = BlockInfo {
            hash: format!("{height:064x}"),
            height,
            slot: height * 20,
            time: height as i64,
        };
        let txs = TransactionStore::new(&tx).unwrap();
        let block_id = txs.upsert_block(NETWORK, &block).unwrap();
        let id = txs
            .insert(&NewTransaction {
                hash: hash.to_string(),
                network_id: NETWORK,
                block_id: Some(block_id),
                ordinal: Some(0),
                status,
                error_message: None,
                extra: None,
            })
            .unwrap();

        let all_addresses: Vec<String> = inputs
            .iter()
            .map(|(_, _, a)| a.clone())
            .chain(outputs.iter().map(|(a, _)| a.clone()))
            .collect();
        let ids = AddressStore::new(&tx)
            .unwrap()
            .get_or_create(ledger_params::ChainProtocol::Cardano, &all_addresses)
            .unwrap();
        let default = TokenStore::new(&tx).unwrap().default_token(NETWORK).unwrap().id;
        let lists = TokenListStore::new(&tx).unwrap();
        let utxos = UtxoStore::new(&tx).unwrap();
        for (i, (parent, index, owner)) in inputs.iter().enumerate() {
            let list = lists.next_list_id().unwrap();
            lists.insert(list, default, &[(default, 0)]).unwrap();
            utxos
                .insert_input(
                    id,
                    &NewUtxoInput {
                        address_id: ids[owner],
                        parent_tx_hash: parent.clone(),
                        parent_index: *index,
                        input_index: i as u32,
                        token_list_id: list,
                    },
                )
                .unwrap();
        }
        for (i, (receiver, amount)) in outputs.iter().enumerate() {
            let list = lists.next_list_id().unwrap();
            lists.insert(list, default, &[(default, *amount)]).unwrap();
            utxos
                .insert_output(
                    id,
                    hash,
                    &NewUtxoOutput {
                        address_id: ids[receiver],
                        output_index: i as u32,
                        token_list_id: list,
                    },
                )
                .unwrap();
        }
        tx.commit().unwrap();
        id
    }

    fn known_ids(&self) -> HashSet<TransactionId> {
        let tx = self.db.read(LockSet::of(TransactionStore::TABLES)).unwrap();
        TransactionStore::new(&tx)
            .unwrap()
            .ids_for_account(self.account)
            .unwrap()
    }
}

#[test]
fn test_spend_marks_parent_output() {
    let f = Fixture::new();
    let a = tx_hash(1);
    let b = tx_hash(2);
    let funding = f.insert(&a, 10, TxStatus::InBlock, &[], &[(addr(1), 100)]);
    let spend = f.insert(
        &b,
        11,
        TxStatus::InBlock,
        &[(a.clone(), 0, addr(1))],
        &[(addr(9), 60), (addr(2), 39)],
    );

    let known = f.known_ids();
    assert!(known.contains(&funding) && known.contains(&spend));

    let tx = f.db.write(all_locks()).unwrap();
    let changed = UtxoStore::new(&tx)
        .unwrap()
        .mark_consumed_spent(&[spend], &known)
        .unwrap();
    assert_eq!(changed, 1);
    tx.commit().unwrap();

    let repo = Repository::new(&f.db);
    assert_eq!(repo.wallet_balance(f.account).unwrap().primary(), 39);
    assert_eq!(repo.foreign_addresses(f.account).unwrap(), vec![addr(9)]);
    let by_address = repo.balance_by_address(f.account).unwrap();
    assert_eq!(by_address.len(), 1);
    assert_eq!(by_address[&addr(2)].primary(), 39);
}

#[test]
fn test_output_arriving_after_its_spender_starts_spent() {
    let f = Fixture::new();
    let a = tx_hash(1);
    let b = tx_hash(2);
    f.insert(&b, 11, TxStatus::InBlock, &[(a.clone(), 0, addr(1))], &[(addr(9), 60)]);
    f.insert(&a, 10, TxStatus::InBlock, &[], &[(addr(1), 100), (addr(2), 5)]);

    let unspent = Repository::new(&f.db).unspent(f.account).unwrap();
    assert_eq!(unspent.len(), 1);
    assert_eq!(unspent[0].output_index, 1);
    assert_eq!(unspent[0].tokens.primary(), 5);
}

#[test]
fn test_unspent_again_after_revert() {
    let f = Fixture::new();
    let a = tx_hash(1);
    let b = tx_hash(2);
    f.insert(&a, 10, TxStatus::InBlock, &[], &[(addr(1), 100)]);
    let spend = f.insert(&b, 11, TxStatus::InBlock, &[(a.clone(), 0, addr(1))], &[(addr(9), 99)]);
    let known = f.known_ids();

    let tx = f.db.write(all_locks()).unwrap();
    let utxos = UtxoStore::new(&tx).unwrap();
    utxos.mark_consumed_spent(&[spend], &known).unwrap();
    // Still live: the output stays spent.
    assert_eq!(utxos.mark_consumed_unspent(&[spend], &known).unwrap(), 0);
    TransactionStore::new(&tx)
        .unwrap()
        .set_status(&[spend], TxStatus::RollbackFail)
        .unwrap();
    assert_eq!(utxos.mark_consumed_unspent(&[spend], &known).unwrap(), 1);
    tx.commit().unwrap();

    assert_eq!(
        Repository::new(&f.db).wallet_balance(f.account).unwrap().primary(),
        100
    );
}

#[test]
fn test_history_orders_pending_first() {
    let f = Fixture::new();
    f.insert(&tx_hash(1), 10, TxStatus::InBlock, &[], &[(addr(1), 1)]);
    f.insert(&tx_hash(2), 20, TxStatus::InBlock, &[], &[(addr(1), 2)]);

    let tx = f.db.write(all_locks()).unwrap();
    let txs = TransactionStore::new(&tx).unwrap();
    let pending = txs
        .insert(&NewTransaction {
            hash: tx_hash(3),
            network_id: NETWORK,
            block_id: None,
            ordinal: None,
            status: TxStatus::Pending,
            error_message: None,
            extra: None,
        })
        .unwrap();
    let ids = AddressStore::new(&tx).unwrap().find(&[addr(2)]).unwrap();
    let default = TokenStore::new(&tx).unwrap().default_token(NETWORK).unwrap().id;
    let lists = TokenListStore::new(&tx).unwrap();
    let list = lists.next_list_id().unwrap();
    lists.insert(list, default, &[(default, 3)]).unwrap();
    UtxoStore::new(&tx)
        .unwrap()
        .insert_output(
            pending,
            &tx_hash(3),
            &NewUtxoOutput {
                address_id: ids[&addr(2)],
                output_index: 0,
                token_list_id: list,
            },
        )
        .unwrap();
    tx.commit().unwrap();

    let repo = Repository::new(&f.db);
    let page = repo.history(f.account, 0, 10).unwrap();
    let hashes: Vec<&str> = page.iter().map(|e| e.transaction.hash.as_str()).collect();
    assert_eq!(hashes, vec![tx_hash(3), tx_hash(2), tx_hash(1)]);
    assert_eq!(page[0].outputs[0].tokens.primary(), 3);

    let second = repo.history(f.account, 1, 1).unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].transaction.hash, tx_hash(2));

    assert_eq!(repo.pending(f.account).unwrap().len(), 1);
    // Unconfirmed outputs do not count towards the balance.
    assert_eq!(repo.wallet_balance(f.account).unwrap().primary(), 3);
}

#[test]
fn test_reset_history_and_remove_wallet() {
    let f = Fixture::new();
    f.insert(&tx_hash(1), 10, TxStatus::InBlock, &[], &[(addr(1), 100)]);

    let repo = Repository::new(&f.db);
    repo.reset_history(f.account).unwrap();
    assert!(repo.history(f.account, 0, 10).unwrap().is_empty());
    assert_eq!(repo.wallet_balance(f.account).unwrap().primary(), 0);
    let count = |table: &str| -> i64 {
        f.db.conn()
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .unwrap()
    };
    assert_eq!(count("blocks"), 0);
    assert_eq!(count("token_lists"), 0);
    // Owned addresses survive a reset.
    assert_eq!(count("account_addresses"), 2);

    repo.remove_wallet(f.account).unwrap();
    assert_eq!(count("wallet_accounts"), 0);
    assert_eq!(count("addresses"), 0);
    assert_eq!(count("last_sync_info"), 0);
    assert!(matches!(repo.remove_wallet(f.account), Err(Error::NotFound(_))));
}

#[test]
fn test_remove_wallet_keeps_shared_transactions() {
    let f = Fixture::new();
    let tx = f.db.write(LockSet::of(AccountStore::TABLES)).unwrap();
    let accounts = AccountStore::new(&tx).unwrap();
    let other = accounts.create("other", NETWORK, WalletKind::Utxo).unwrap().id;
    accounts.add_owned_addresses(other, &[addr(7)]).unwrap();
    tx.commit().unwrap();

    f.insert(&tx_hash(1), 10, TxStatus::InBlock, &[], &[(addr(1), 5), (addr(7), 6)]);
    f.insert(&tx_hash(2), 11, TxStatus::InBlock, &[], &[(addr(2), 9)]);

    let repo = Repository::new(&f.db);
    repo.remove_wallet(f.account).unwrap();
    let remaining = repo.history(other, 0, 10).unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].transaction.hash, tx_hash(1));
    assert_eq!(repo.wallet_balance(other).unwrap().primary(), 6);
}

/// Give the row holding `victim` the digest of the row holding `original`
fn copy_digest(tx: &ScopedTx<'_>, table: &str, column: &str, original: &str, victim: &str) {
    let sql = format!(
        "UPDATE {table} SET digest = (SELECT digest FROM {table} WHERE {column} = ?1) WHERE {column} = ?2"
    );
    assert_eq!(tx.execute(&sql, rusqlite::params![original, victim]).unwrap(), 1);
}

#[test]
fn test_digest_collisions_only_return_exact_matches() {
    let f = Fixture::new();
    let a = tx_hash(1);
    let c = tx_hash(3);
    let funding = f.insert(&a, 10, TxStatus::InBlock, &[], &[(addr(1), 100)]);
    let twin = f.insert(&c, 10, TxStatus::InBlock, &[], &[(addr(2), 7)]);

    let tx = f.db.write(all_locks()).unwrap();
    let tokens = TokenStore::new(&tx).unwrap();
    tokens
        .upsert(NETWORK, "p.one", false, &TokenMetadata::default(), None)
        .unwrap();
    tokens
        .upsert(NETWORK, "p.two", false, &TokenMetadata::default(), None)
        .unwrap();
    copy_digest(&tx, "transactions", "hash", &a, &c);
    copy_digest(&tx, "addresses", "hash", &addr(1), &addr(2));
    copy_digest(&tx, "tokens", "identifier", "p.one", "p.two");
    tx.commit().unwrap();

    let known = f.known_ids();
    let tx = f.db.read(all_locks()).unwrap();
    let found = AddressStore::new(&tx).unwrap().find(&[addr(1)]).unwrap();
    assert_eq!(found.len(), 1);
    assert!(found.contains_key(&addr(1)));

    let rows = TransactionStore::new(&tx)
        .unwrap()
        .find_by_hashes(NETWORK, &[a.clone()], Some(&known))
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[&a].id, funding);

    let rows = TokenStore::new(&tx)
        .unwrap()
        .get_many(NETWORK, &["p.two".to_string()])
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows["p.two"].identifier, "p.two");
    drop(tx);

    // Parent lookup must pick `a`, not its twin sharing the digest
    let spend = f.insert(&tx_hash(2), 11, TxStatus::InBlock, &[(a.clone(), 0, addr(1))], &[(addr(9), 99)]);
    let known = f.known_ids();
    assert!(known.contains(&twin));
    let tx = f.db.write(all_locks()).unwrap();
    let changed = UtxoStore::new(&tx)
        .unwrap()
        .mark_consumed_spent(&[spend], &known)
        .unwrap();
    assert_eq!(changed, 1);
    tx.commit().unwrap();

    let unspent = Repository::new(&f.db).unspent(f.account).unwrap();
    assert_eq!(unspent.len(), 1);
    assert_eq!(unspent[0].tx_hash, c);
    assert_eq!(unspent[0].tokens.primary(), 7);
}

#[test]
fn test_unspent_at_height_ignores_later_spends() {
    let f = Fixture::new();
    let a = tx_hash(1);
    f.insert(&a, 10, TxStatus::InBlock, &[], &[(addr(1), 100)]);
    let spend = f.insert(&tx_hash(2), 12, TxStatus::InBlock, &[(a.clone(), 0, addr(1))], &[(addr(2), 90)]);
    let known = f.known_ids();
    let tx = f.db.write(all_locks()).unwrap();
    UtxoStore::new(&tx)
        .unwrap()
        .mark_consumed_spent(&[spend], &known)
        .unwrap();

    let at = |height: u64| -> Vec<(String, u32)> {
        unspent_outputs_at(&tx, f.account, height)
            .unwrap()
            .into_iter()
            .map(|u| (u.tx_hash, u.output_index))
            .collect()
    };
    assert!(at(9).is_empty());
    assert_eq!(at(11), vec![(a.clone(), 0)]);
    assert_eq!(at(12), vec![(tx_hash(2), 0)]);
}
