//! Table and status rendering for the CLI.

pub mod table;
