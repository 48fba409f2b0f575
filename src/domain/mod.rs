//! Domain types and state transitions
//!
//! Entities for the import pipeline (batches, records, rules), calendar
//! events and schedule optimization. Transitions are pure functions on these
//! types; the store layer persists their results.

pub mod events;
pub mod imports;
pub mod records;
pub mod rules;
pub mod schedule;

pub use events::*;
pub use imports::*;
pub use records::*;
pub use rules::*;
pub use schedule::*;
