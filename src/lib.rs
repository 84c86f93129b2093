//! Mjit scalar optimization library.
//!
//! This crate contains the value-number based common subexpression
//! elimination pass of the mjit compiler, together with the tree IR,
//! local-variable table and value-number store it operates on. The pass
//! consumes a method whose control-flow graph, statement trees and value
//! numbers have already been computed by earlier phases, and rewrites
//! redundant expressions into definitions and reads of compiler
//! temporaries.

#![deny(trivial_numeric_casts, unused_extern_crates)]
#![warn(missing_docs, unused_import_braces)]

pub use cranelift_entity as entity;

pub mod bitvec;
pub mod config;
pub mod cse;
pub mod ir;
pub mod valnum;

mod fx;

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
