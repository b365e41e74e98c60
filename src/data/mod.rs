//! Trace reduction and result persistence.

pub mod reducer;
pub mod storage;

pub use reducer::{reduce, reduce_columns};
pub use storage::CsvReportSink;
