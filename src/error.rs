// Copyright (c) 2024 Espresso Systems (espressosys.com)
// This file is part of the HotShot Builder Protocol.
//

use crate::context::ContextError;
use snafu::Snafu;

/// Errors returned by a proposal build.
///
/// These never leave the proposal builder's loop: they are logged and the previously retained
/// proposal is kept.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub))]
pub enum BuildError {
    /// The build observed its context being done and abandoned the proposal
    #[snafu(display("proposal build abandoned: {reason}"))]
    Cancelled { reason: ContextError },

    #[snafu(display("out of gas: limit {limit}, consumed {consumed}, wanted {wanted}"))]
    OutOfGas {
        limit: u64,
        consumed: u64,
        wanted: u64,
    },

    /// The data a build depends on has already moved past the requested height
    #[snafu(display("height {requested} has already passed, current height is {current}"))]
    StaleHeight { requested: u64, current: u64 },

    #[snafu(display("{message}"))]
    Error { message: String },
}

impl From<ContextError> for BuildError {
    fn from(reason: ContextError) -> Self {
        BuildError::Cancelled { reason }
    }
}
