//! Selects the trades of a batch that belong to the active symbol.

use crate::types::Trade;

/// Return the trades whose symbol equals `active` exactly (case-sensitive,
/// exchange prefix included), keeping arrival order. No match is an empty
/// result, not an error.
pub fn for_symbol(batch: Vec<Trade>, active: &str) -> Vec<Trade> {
    batch.into_iter().filter(|t| t.symbol == active).collect()
}
