//! Tiered quota limits and history retention.

mod table;

pub use table::{LimitTable, LimitTableBuilder, LimitsDocument, default_limit_table};
