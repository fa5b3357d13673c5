use serde::{Deserialize, Serialize};

use crate::storage::btree::insert::MAX_DEPTH;
use crate::types::{Result, SombraError};

/// Configuration knobs for a tree.
///
/// Every field has a default, so a TOML document only needs the keys it
/// changes:
///
/// ```
/// use sombra_engine::storage::TreeOptions;
///
/// let opts = TreeOptions::from_toml_str("leaf_page_max = 8192\nsplit_pct = 75\n").unwrap();
/// assert_eq!(opts.leaf_page_max, 8192);
/// assert_eq!(opts.split_pct, 75);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeOptions {
    /// Maximum image size of a leaf page in bytes
    pub leaf_page_max: usize,
    /// Maximum image size of an internal page in bytes
    pub internal_page_max: usize,
    /// Fill percentage at which reconciliation starts a new chunk (50-100)
    pub split_pct: u8,
    /// Smallest fill percentage the trailing chunk of a split may keep
    pub min_split_pct: u8,
    /// Values larger than this are written as overflow blocks (0 = half a leaf)
    pub max_inline_value: usize,
    /// Whether row keys share prefixes with their predecessor in page images
    pub prefix_compression: bool,
    /// Number of distinct values remembered per image for copy cells (0 disables)
    pub dictionary_entries: usize,
    /// Deleted rows a cursor may skip on a page before flagging it for eviction
    pub delete_skip_threshold: usize,
    /// Whether eviction may rebuild a page from its image plus saved updates
    pub update_restore: bool,
    /// Whether eviction may park saved updates in the lookaside table
    pub lookaside: bool,
    /// Whether block checksums are verified on read
    pub checksum_verify: bool,
    /// Maximum skip-list depth of insert lists
    pub skip_depth: usize,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            leaf_page_max: 32 * 1024,
            internal_page_max: 4 * 1024,
            split_pct: 90,
            min_split_pct: 50,
            max_inline_value: 0,
            prefix_compression: true,
            dictionary_entries: 16,
            delete_skip_threshold: 1_000,
            update_restore: true,
            lookaside: false,
            checksum_verify: true,
            skip_depth: MAX_DEPTH,
        }
    }
}

impl TreeOptions {
    /// Parses options from a TOML document and validates them.
    pub fn from_toml_str(src: &str) -> Result<Self> {
        let opts: TreeOptions =
            toml::from_str(src).map_err(|err| SombraError::Config(err.to_string()))?;
        opts.validate()?;
        Ok(opts)
    }

    /// Renders the options as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|err| SombraError::Config(err.to_string()))
    }

    /// Rejects sizes and percentages the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.leaf_page_max < 512 || self.internal_page_max < 512 {
            return Err(SombraError::Invalid("page maximum below 512 bytes"));
        }
        if self.leaf_page_max > u32::MAX as usize || self.internal_page_max > u32::MAX as usize {
            return Err(SombraError::Invalid("page maximum too large"));
        }
        if !(50..=100).contains(&self.split_pct) {
            return Err(SombraError::Invalid("split_pct must be within 50..=100"));
        }
        if self.min_split_pct == 0 || self.min_split_pct >= self.split_pct {
            return Err(SombraError::Invalid("min_split_pct must be below split_pct"));
        }
        if self.max_inline_value != 0
            && (self.max_inline_value < 16 || self.max_inline_value > self.leaf_page_max / 2)
        {
            return Err(SombraError::Invalid(
                "max_inline_value must be 0 or within 16..=leaf_page_max/2",
            ));
        }
        if self.skip_depth == 0 || self.skip_depth > MAX_DEPTH {
            return Err(SombraError::Invalid("skip_depth out of range"));
        }
        Ok(())
    }

    /// Largest value stored inline in a leaf image.
    pub fn inline_limit(&self) -> usize {
        match self.max_inline_value {
            0 => self.leaf_page_max / 2,
            bytes => bytes,
        }
    }

    /// Longest key a row tree accepts: a quarter of the smaller page
    /// maximum, so leaves and parents always hold several keys.
    pub fn max_key_size(&self) -> usize {
        self.leaf_page_max.min(self.internal_page_max) / 4
    }

    /// Refuses keys longer than [`TreeOptions::max_key_size`].
    pub fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() > self.max_key_size() {
            return Err(SombraError::Invalid("key longer than max_key_size"));
        }
        Ok(())
    }

    /// Byte size at which a chunk of a page with maximum `page_max` is closed.
    pub fn split_size(&self, page_max: usize) -> usize {
        page_max * self.split_pct as usize / 100
    }

    /// Smallest byte size the trailing chunk of a split should keep.
    pub fn min_split_size(&self, page_max: usize) -> usize {
        page_max * self.min_split_pct as usize / 100
    }

    /// Sets the leaf page maximum.
    pub fn leaf_page_max(mut self, bytes: usize) -> Self {
        self.leaf_page_max = bytes;
        self
    }

    /// Sets the internal page maximum.
    pub fn internal_page_max(mut self, bytes: usize) -> Self {
        self.internal_page_max = bytes;
        self
    }

    /// Sets the split percentage.
    pub fn split_pct(mut self, pct: u8) -> Self {
        self.split_pct = pct;
        self
    }

    /// Sets the minimum split percentage.
    pub fn min_split_pct(mut self, pct: u8) -> Self {
        self.min_split_pct = pct;
        self
    }

    /// Sets the overflow threshold.
    pub fn max_inline_value(mut self, bytes: usize) -> Self {
        self.max_inline_value = bytes;
        self
    }

    /// Enables or disables key prefix compression.
    pub fn prefix_compression(mut self, enabled: bool) -> Self {
        self.prefix_compression = enabled;
        self
    }

    /// Sets the per-image dictionary size.
    pub fn dictionary_entries(mut self, entries: usize) -> Self {
        self.dictionary_entries = entries;
        self
    }

    /// Sets the cursor delete-skip threshold.
    pub fn delete_skip_threshold(mut self, rows: usize) -> Self {
        self.delete_skip_threshold = rows;
        self
    }

    /// Enables or disables update-restore eviction.
    pub fn update_restore(mut self, enabled: bool) -> Self {
        self.update_restore = enabled;
        self
    }

    /// Enables or disables lookaside eviction.
    pub fn lookaside(mut self, enabled: bool) -> Self {
        self.lookaside = enabled;
        self
    }

    /// Enables or disables checksum verification on read.
    pub fn checksum_verify(mut self, enabled: bool) -> Self {
        self.checksum_verify = enabled;
        self
    }

    /// Sets the insert-list depth bound.
    pub fn skip_depth(mut self, depth: usize) -> Self {
        self.skip_depth = depth;
        self
    }
}
