//! Upload ingestion: spreadsheet parsing and key-column validation

mod table;

pub use table::{read_table, TableFormat};
