// Copyright (c) 2024 Espresso Systems (espressosys.com)
// This file is part of the HotShot Builder Protocol.
//

use crate::proposal::Transaction;
use parking_lot::RwLock;
use std::collections::HashMap;

type TxHash = [u8; 32];

#[derive(Debug, Default)]
struct Inner {
    txs: Vec<Transaction>,
    /// position of every transaction in `txs`
    index: HashMap<TxHash, usize>,
}

/// The set of transactions that passed recheck at one height.
///
/// Many recheck workers add to and remove from the same store concurrently, so every operation
/// takes `&self`. Insertion order is kept until a transaction is removed, removal moves the last
/// transaction into the freed slot.
#[derive(Debug, Default)]
pub struct TxStore {
    inner: RwLock<Inner>,
}

impl TxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a transaction. Returns `false` if the store already held it.
    pub fn add_tx(&self, tx: Transaction) -> bool {
        let hash = tx.commitment();
        let mut inner = self.inner.write();
        if inner.index.contains_key(&hash) {
            return false;
        }
        let position = inner.txs.len();
        inner.index.insert(hash, position);
        inner.txs.push(tx);
        true
    }

    /// Remove a transaction. Returns `false` if the store did not hold it.
    pub fn remove_tx(&self, tx: &Transaction) -> bool {
        let mut inner = self.inner.write();
        let Some(position) = inner.index.remove(&tx.commitment()) else {
            return false;
        };

        inner.txs.swap_remove(position);
        if let Some(moved) = inner.txs.get(position) {
            let moved = moved.commitment();
            inner.index.insert(moved, position);
        }
        true
    }

    pub fn contains(&self, tx: &Transaction) -> bool {
        self.inner.read().index.contains_key(&tx.commitment())
    }

    /// Snapshot of the stored transactions
    pub fn txs(&self) -> Vec<Transaction> {
        self.inner.read().txs.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
