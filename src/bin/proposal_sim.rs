// Copyright (c) 2024 Espresso Systems (espressosys.com)
// This file is part of the HotShot Builder Protocol.
//

//! Runs optimistic proposal building against a simulated chain.
//!
//! Every simulated block goes through the same steps a node takes: the proposer asks for a
//! proposal, the proposal is accepted and committed, and the mempool is rechecked against the
//! new height while a builder already works on the next one.
//!
//! ```bash
//! RUST_LOG=info proposal-sim --heights 20 --txs-per-height 500 --block-time-ms 200
//! ```

use anyhow::Context as _;
use async_std::task;
use clap::Parser;
use proposal_builder_core::execution::{ConsensusParams, ProposalHost};
use proposal_builder_core::selector::RecheckedTxsBuilder;
use proposal_builder_core::service::{OptimisticProposer, Options};
use proposal_builder_core::tx_store::TxStore;
use proposal_builder_core::{HeightGate, PrepareProposalRequest, Transaction};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

const RECHECK_WORKERS: usize = 4;
const TX_GAS_LIMIT: u64 = 21_000;

#[derive(Parser, Debug)]
#[command(name = "proposal-sim", version, about, long_about = None)]
struct Args {
    #[clap(flatten)]
    options: Options,

    /// Number of blocks to produce
    #[arg(long, default_value = "10")]
    heights: u64,

    /// Transactions arriving in the mempool per block
    #[arg(long, default_value = "200")]
    txs_per_height: usize,

    /// Milliseconds between a commit and the next proposal request
    #[arg(long, default_value = "500")]
    block_time_ms: u64,

    /// Block size limit, including the non transaction overhead
    #[arg(long, default_value = "65536")]
    max_block_bytes: u64,

    /// Block gas limit, 0 for none
    #[arg(long, default_value = "0")]
    max_block_gas: u64,
}

#[derive(Debug)]
struct SimHost {
    params: ConsensusParams,
}

impl ProposalHost for SimHost {
    type State = ();

    fn branch_state(&self) {}

    fn consensus_params(&self, _: &()) -> ConsensusParams {
        self.params
    }
}

fn arriving_txs(height: u64, n: usize) -> Vec<Transaction> {
    (0..n)
        .map(|i| Transaction::new(format!("transfer {height}/{i}").into_bytes(), TX_GAS_LIMIT))
        .collect()
}

/// Recheck the mempool against the committed `height` on a few workers at once.
async fn recheck(store: &Arc<HeightGate<TxStore>>, height: u64, mempool: &[Transaction]) {
    store.start_new_height(height).await;

    let chunk = mempool.len().div_ceil(RECHECK_WORKERS).max(1);
    let workers: Vec<_> = mempool
        .chunks(chunk)
        .map(|txs| {
            let store = Arc::clone(store);
            let txs = txs.to_vec();
            task::spawn(async move {
                store
                    .with_value(|rechecked| {
                        for tx in txs {
                            rechecked.add_tx(tx);
                        }
                    })
                    .await
            })
        })
        .collect();
    for worker in workers {
        worker.await;
    }

    store.end_current_height().await;
}

#[async_std::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = args.options.config();
    info!(?args, "starting proposal simulation");

    let host = Arc::new(SimHost {
        params: ConsensusParams {
            max_block_bytes: args.max_block_bytes,
            max_block_gas: Some(args.max_block_gas).filter(|gas| *gas > 0),
        },
    });
    let max_tx_bytes = args
        .max_block_bytes
        .saturating_sub(config.block_overhead_bytes);

    let store = Arc::new(HeightGate::new(0, TxStore::new));
    let build = Arc::new(RecheckedTxsBuilder::new(
        Arc::clone(&store),
        args.options.recheck_wait(),
    ));
    let proposer = OptimisticProposer::new(Arc::clone(&host), build, config);

    let mut mempool = arriving_txs(0, args.txs_per_height);
    store
        .with_value(|genesis| {
            for tx in &mempool {
                genesis.add_tx(tx.clone());
            }
        })
        .await;

    for height in 1..=args.heights {
        let proposal = proposer
            .prepare_proposal(PrepareProposalRequest {
                height,
                max_tx_bytes,
            })
            .await
            .with_context(|| format!("building the proposal for height {height}"))?;
        proposer.process_proposal(height, true).await;

        info!(
            height,
            num_txs = proposal.num_txs(),
            tx_bytes = proposal.tx_bytes(),
            commitment = %proposal.commitment(),
            "committing block"
        );

        let included: HashSet<_> = proposal.txs.iter().map(Transaction::commitment).collect();
        mempool.retain(|tx| !included.contains(&tx.commitment()));
        mempool.extend(arriving_txs(height, args.txs_per_height));

        proposer.on_commit(height).await;
        recheck(&store, height, &mempool).await;

        task::sleep(Duration::from_millis(args.block_time_ms)).await;
    }

    proposer.shutdown().await;
    info!(pending = mempool.len(), "simulation finished");
    Ok(())
}
