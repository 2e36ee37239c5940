//! # Source-language data
//!
//! `node` defines the AST handed to the compiler by the external parser.
//! `value` defines the host-side view of machine values.

pub mod node;
pub mod value;
