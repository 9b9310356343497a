// Copyright 2024-Present mesytec GmbH & Co. KG <info@mesytec.com>
// SPDX-License-Identifier: Apache-2.0

//! Cross-crate event building.
//!
//! Module fragments of one physics event arrive from multiple crates with
//! independent, nearly-synchronized clocks. For each event index one main
//! module provides the reference timestamp; every other participating
//! module is matched against it inside a signed window on a 30-bit
//! wrapping counter. Assembly is memory bounded: exceeding the configured
//! limit discards all buffered data.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

mod builder;
pub mod extractors;
pub mod filter;

pub use builder::{
    timestamp_match, CrateSetup, EventBuilder, EventBuilderConfig, EventBuilderCounters,
    EventCounters, EventSetup, WindowMatch, WindowMatchResult, DEFAULT_MATCH_WINDOW,
    DEFAULT_MEMORY_LIMIT, TIMESTAMP_EXTRACTION_FAILED, TIMESTAMP_HALF, TIMESTAMP_MAX,
};
pub use extractors::{
    make_mesytec_default_timestamp_extractor, IndexedTimestampFilterExtractor,
    InvalidTimestampExtractor, TimestampExtractor, TimestampFilterExtractor,
};
pub use filter::{make_filter, DataFilter, FilterCache};
