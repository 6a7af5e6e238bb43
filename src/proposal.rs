// Copyright (c) 2024 Espresso Systems (espressosys.com)
// This file is part of the HotShot Builder Protocol.
//

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io;

/// An opaque transaction as it is included in a block
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transaction {
    pub data: Vec<u8>,
    /// gas the transaction may use at most
    pub gas_limit: u64,
}

impl Transaction {
    pub fn new(data: impl Into<Vec<u8>>, gas_limit: u64) -> Self {
        Self {
            data: data.into(),
            gas_limit,
        }
    }

    /// Size of the transaction once encoded into a block, this is what counts against the byte
    /// budget of a proposal.
    pub fn encoded_len(&self) -> u64 {
        // length prefix + data + gas limit, bincode never fails to size this
        bincode::serialized_size(self).unwrap_or(self.data.len() as u64 + 16)
    }

    /// SHA-256 over the encoded transaction
    pub fn commitment(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        // serializing into the hasher only fails on writer errors, which a hasher never returns
        if let Err(err) = bincode::serialize_into(HashWriter(&mut hasher), self) {
            tracing::error!(%err, "failed to encode transaction for its commitment");
        }
        hasher.finalize().into()
    }
}

/// Feeds everything written to it into a hasher
struct HashWriter<'a>(&'a mut Sha256);

impl io::Write for HashWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("commitment", &hex::encode(&self.commitment()[..8]))
            .field("len", &self.data.len())
            .field("gas_limit", &self.gas_limit)
            .finish()
    }
}

/// The best currently known candidate block body for a height.
///
/// The number of included transactions is the only signal used to compare two proposals.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub txs: Vec<Transaction>,
}

impl Proposal {
    pub fn new(txs: Vec<Transaction>) -> Self {
        Self { txs }
    }

    pub fn num_txs(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    /// Byte budget used up by the transactions
    pub fn tx_bytes(&self) -> u64 {
        self.txs.iter().map(Transaction::encoded_len).sum()
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Hex encoded SHA-256 over the commitments of the included transactions, in order
    pub fn commitment(&self) -> String {
        let mut hasher = Sha256::new();
        for tx in &self.txs {
            hasher.update(tx.commitment());
        }
        hex::encode(hasher.finalize())
    }
}

/// What the proposer asks for: a proposal at `height` whose transactions fit in `max_tx_bytes`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareProposalRequest {
    pub height: u64,
    pub max_tx_bytes: u64,
}
