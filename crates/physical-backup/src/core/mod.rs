//! Core types shared by every component.
//!
//! - [`identifier`]: identifier validation, quoting and file name mapping
//! - [`table`]: table descriptors and engine classification

pub mod identifier;
pub mod table;

pub use identifier::{file_stem, quote_ident, quote_list, validate_identifier};
pub use table::{Engine, TableDescriptor, TableSet};
