// Copyright 2024-Present mesytec GmbH & Co. KG <info@mesytec.com>
// SPDX-License-Identifier: Apache-2.0

//! Request/response dialog with the MVLC on the command pipe.
//!
//! A super transaction writes one command buffer and verifies the mirrored
//! response; a stack transaction uploads a stack to the immediate slot,
//! triggers it, and collects the framed response including continuations.
//! Stack error notifications interleaved with responses are captured into
//! counters instead of being surfaced as errors.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

mod dialog;
pub mod util;

pub use dialog::{check_mirror, Dialog, StackErrorCounters, StackErrorKey};
