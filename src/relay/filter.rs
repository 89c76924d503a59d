//! Row filtering.
//!
//! A relay is constructed with an optional filter capability that gets
//! the final say on every row about to be sent. The contract: the filter
//! never invalidates the original row, and the relay advances its clock
//! from the original even when the filter substitutes a replacement.

use crate::xrow::Row;

/// Filter verdict for one row.
#[derive(Debug, Clone)]
pub enum FilterAction {
    /// Send the row unchanged.
    Pass,
    /// Send this replacement instead; clock metadata of the original
    /// still governs the relay's progress.
    Rewrite(Row),
    /// Drop the row without advancing the relay clock.
    Skip,
    /// Terminate the relay with this error message.
    Abort(String),
}

/// Filter capability captured at relay construction.
pub type RowFilter = Box<dyn FnMut(&Row) -> FilterAction + Send>;

/// The default filter: everything passes.
pub fn pass_all() -> RowFilter {
    Box::new(|_| FilterAction::Pass)
}
