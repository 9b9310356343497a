// Copyright 2024-Present mesytec GmbH & Co. KG <info@mesytec.com>
// SPDX-License-Identifier: Apache-2.0

//! Timestamp extraction from module data.

use crate::builder::TIMESTAMP_EXTRACTION_FAILED;
use crate::filter::{make_filter, DataFilter, FilterCache};

/// Pulls a timestamp out of one module's data words, or
/// [`TIMESTAMP_EXTRACTION_FAILED`].
pub trait TimestampExtractor: Send {
    fn extract(&self, data: &[u32]) -> u32;
}

/// Boxed extractor stored per module.
pub type BoxedTimestampExtractor = Box<dyn TimestampExtractor>;

/// Applies a filter to the word at a fixed index. Negative indexes count
/// from the end of the data (`-1` is the last word).
pub struct IndexedTimestampFilterExtractor {
    filter: DataFilter,
    cache: FilterCache,
    index: i32,
}

impl IndexedTimestampFilterExtractor {
    pub fn new(filter: DataFilter, word_index: i32, match_char: u8) -> Self {
        let cache = filter.make_cache(match_char);
        Self {
            filter,
            cache,
            index: word_index,
        }
    }
}

impl TimestampExtractor for IndexedTimestampFilterExtractor {
    fn extract(&self, data: &[u32]) -> u32 {
        let index = if self.index < 0 {
            let abs = data.len() as i64 + i64::from(self.index);
            if abs < 0 {
                return TIMESTAMP_EXTRACTION_FAILED;
            }
            abs as usize
        } else {
            self.index as usize
        };

        match data.get(index) {
            Some(&word) if self.filter.matches(word) => self.filter.extract_cached(&self.cache, word),
            _ => TIMESTAMP_EXTRACTION_FAILED,
        }
    }
}

/// The standard mesytec module timestamp: the 30 low bits of the last
/// data word, whose two top bits are set.
pub fn make_mesytec_default_timestamp_extractor() -> IndexedTimestampFilterExtractor {
    IndexedTimestampFilterExtractor::new(
        make_filter("11DDDDDDDDDDDDDDDDDDDDDDDDDDDDDD"),
        -1,
        b'D',
    )
}

/// Scans the data for the first word matching the filter.
pub struct TimestampFilterExtractor {
    filter: DataFilter,
    cache: FilterCache,
}

impl TimestampFilterExtractor {
    pub fn new(filter: DataFilter, match_char: u8) -> Self {
        let cache = filter.make_cache(match_char);
        Self { filter, cache }
    }
}

impl TimestampExtractor for TimestampFilterExtractor {
    fn extract(&self, data: &[u32]) -> u32 {
        data.iter()
            .copied()
            .find(|&w| self.filter.matches(w))
            .map(|w| self.filter.extract_cached(&self.cache, w))
            .unwrap_or(TIMESTAMP_EXTRACTION_FAILED)
    }
}

/// Always fails extraction. Used to make the event builder ignore a
/// module.
pub struct InvalidTimestampExtractor;

impl TimestampExtractor for InvalidTimestampExtractor {
    fn extract(&self, _data: &[u32]) -> u32 {
        TIMESTAMP_EXTRACTION_FAILED
    }
}

impl<F> TimestampExtractor for F
where
    F: Fn(&[u32]) -> u32 + Send,
{
    fn extract(&self, data: &[u32]) -> u32 {
        self(data)
    }
}
