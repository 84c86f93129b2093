//! Tree intermediate representation.
//!
//! The optimizer works on a method whose control flow graph and statement
//! trees were produced by the front end. Blocks, statements, expression
//! nodes and locals are densely numbered entity references into maps owned
//! by the `Function`.

use cranelift_entity::entity_impl;

mod function;
mod locals;
mod node;
mod types;

pub use self::function::{BlockData, Function, NodeLink, StmtData};
pub use self::locals::{LocalData, LocalTable, SsaDefData};
pub use self::node::{CseTag, NodeData, NodeFlags, Opcode};
pub use self::types::Ty;

/// An opaque reference to a basic block.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block(u32);
entity_impl!(Block, "block");

/// An opaque reference to a statement.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Stmt(u32);
entity_impl!(Stmt, "stmt");

/// An opaque reference to an expression tree node.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Node(u32);
entity_impl!(Node, "node");

/// An opaque reference to a local variable.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Local(u32);
entity_impl!(Local, "v");

/// An opaque reference to a single-def SSA record of a local.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SsaDef(u32);
entity_impl!(SsaDef, "ssa");
