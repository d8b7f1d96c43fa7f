//! Terminal output for the CLI: summary tables and spinners.

pub mod progress;
pub mod tables;

pub use progress::create_spinner;
pub use tables::{TableBuilder, create_build_table, create_centroid_table, create_search_table};
