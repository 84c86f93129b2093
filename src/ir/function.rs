//! A method under optimization: blocks, statements and expression trees.

use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::PrimaryMap;
use smallvec::{smallvec, SmallVec};

use super::{Block, Local, LocalTable, Node, NodeData, NodeFlags, Opcode, Stmt, Ty};
use crate::ir::node::CseTag;
use crate::valnum::VnPair;

/// A statement: one root expression executed for its effect.
#[derive(Clone, Debug)]
pub struct StmtData {
    /// Root of the statement's tree.
    pub root: Node,
    /// The block the statement belongs to.
    pub block: Block,
}

/// Per-block data. Predecessor and successor edges are part of the input
/// CFG; the optimizer never rewrites them.
#[derive(Clone, Debug, Default)]
pub struct BlockData {
    /// Statements in execution order.
    pub stmts: Vec<Stmt>,
    /// Predecessor blocks.
    pub preds: Vec<Block>,
    /// Successor blocks.
    pub succs: Vec<Block>,
    /// Profile weight; 1.0 is a block executed once per invocation.
    pub weight: f64,
    /// The block contains a call.
    pub has_call: bool,
    /// The block is the entry of an exception handler or filter.
    pub is_handler_entry: bool,
    /// A prior phase proved nothing is available on entry here.
    pub suppress_cse_in: bool,
}

/// Where a tree node hangs inside its statement.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NodeLink {
    /// The node is the statement root.
    Root(Stmt),
    /// The node is child `1` of node `0`.
    Arg(Node, usize),
}

/// A method: layout of blocks, statements, the tree node pool and the
/// local table.
#[derive(Default)]
pub struct Function {
    /// Method name, for logging.
    pub name: String,
    /// Stable hash of the method identity, consulted by config knobs.
    pub method_hash: u32,
    /// All tree nodes.
    pub nodes: PrimaryMap<Node, NodeData>,
    /// All statements.
    pub stmts: PrimaryMap<Stmt, StmtData>,
    /// All blocks.
    pub blocks: PrimaryMap<Block, BlockData>,
    /// Blocks in layout order; the first is the method entry.
    pub layout: Vec<Block>,
    /// The local variable table.
    pub locals: LocalTable,
}

impl Function {
    /// Create an empty function.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new block with unity weight and append it to the layout.
    pub fn create_block(&mut self) -> Block {
        let block = self.blocks.push(BlockData {
            weight: 1.0,
            ..BlockData::default()
        });
        self.layout.push(block);
        block
    }

    /// The method entry block.
    pub fn entry_block(&self) -> Option<Block> {
        self.layout.first().copied()
    }

    /// Record a CFG edge.
    pub fn add_edge(&mut self, from: Block, to: Block) {
        self.blocks[from].succs.push(to);
        self.blocks[to].preds.push(from);
    }

    /// Layout position of `block`.
    pub fn layout_index(&self, block: Block) -> usize {
        self.layout
            .iter()
            .position(|&b| b == block)
            .expect("block is not in the layout")
    }

    fn make_node(
        &mut self,
        op: Opcode,
        ty: Ty,
        args: [Option<Node>; 2],
        vnp: VnPair,
    ) -> Node {
        let (cost_ex, cost_sz) = op.default_costs();
        let mut flags = NodeFlags::new();
        let mut ex = u32::from(cost_ex);
        let mut sz = u32::from(cost_sz);
        for arg in args.iter().flatten() {
            let child = &self.nodes[*arg];
            flags.inherit_from(child.flags);
            ex += u32::from(child.cost_ex);
            sz += u32::from(child.cost_sz);
        }
        self.nodes.push(NodeData {
            op,
            ty,
            args: [args[0].into(), args[1].into()],
            imm: 0,
            struct_size: 0,
            local: PackedOption::default(),
            ssa: PackedOption::default(),
            cost_ex: ex.min(u32::from(u16::MAX)) as u16,
            cost_sz: sz.min(u32::from(u16::MAX)) as u16,
            flags,
            vnp,
            cse_tag: CseTag::NONE,
        })
    }

    /// Build an integer constant node.
    pub fn iconst(&mut self, ty: Ty, value: i64, vnp: VnPair) -> Node {
        let n = self.make_node(Opcode::IntConst, ty, [None, None], vnp);
        self.nodes[n].imm = value;
        n
    }

    /// Build a read of `local`.
    pub fn local_read(&mut self, local: Local, ty: Ty, vnp: VnPair) -> Node {
        let n = self.make_node(Opcode::LocalRead, ty, [None, None], vnp);
        self.nodes[n].local = local.into();
        n
    }

    /// Build a store of `value` into `local`. Stores are side effects.
    pub fn store_local(&mut self, local: Local, value: Node, vnp: VnPair) -> Node {
        let n = self.make_node(Opcode::StoreLocal, Ty::Void, [Some(value), None], vnp);
        self.nodes[n].local = local.into();
        self.nodes[n].flags.set_side_effect();
        n
    }

    /// Build a binary operator node.
    pub fn binop(&mut self, op: Opcode, ty: Ty, a: Node, b: Node, vnp: VnPair) -> Node {
        self.make_node(op, ty, [Some(a), Some(b)], vnp)
    }

    /// Build a unary operator node.
    pub fn unop(&mut self, op: Opcode, ty: Ty, a: Node, vnp: VnPair) -> Node {
        self.make_node(op, ty, [Some(a), None], vnp)
    }

    /// Build a load through `addr`.
    pub fn load(&mut self, ty: Ty, addr: Node, vnp: VnPair) -> Node {
        self.make_node(Opcode::Load, ty, [Some(addr), None], vnp)
    }

    /// Build an array length node.
    pub fn arr_len(&mut self, array: Node, vnp: VnPair) -> Node {
        self.make_node(Opcode::ArrLen, Ty::I32, [Some(array), None], vnp)
    }

    /// Build a bounds check of `index` against `length`.
    pub fn bounds_check(&mut self, index: Node, length: Node, vnp: VnPair) -> Node {
        let n = self.make_node(Opcode::BoundsCheck, Ty::Void, [Some(index), Some(length)], vnp);
        self.nodes[n].flags.set_side_effect();
        n
    }

    /// Build a comma: evaluate `effect`, yield `value`.
    pub fn comma(&mut self, ty: Ty, effect: Node, value: Node, vnp: VnPair) -> Node {
        self.make_node(Opcode::Comma, ty, [Some(effect), Some(value)], vnp)
    }

    /// Build a call. `side_effecting` is false only for the re-runnable
    /// helper calls that merely materialize a value.
    pub fn call(&mut self, ty: Ty, side_effecting: bool, vnp: VnPair) -> Node {
        let n = self.make_node(Opcode::Call, ty, [None, None], vnp);
        self.nodes[n].flags.set_has_call();
        if side_effecting {
            self.nodes[n].flags.set_side_effect();
        }
        n
    }

    /// Build a return of `value`.
    pub fn return_(&mut self, value: Option<Node>, vnp: VnPair) -> Node {
        self.make_node(Opcode::Return, Ty::Void, [value, None], vnp)
    }

    /// Append a statement rooted at `root` to `block`.
    pub fn append_stmt(&mut self, block: Block, root: Node) -> Stmt {
        let stmt = self.stmts.push(StmtData { root, block });
        if self.nodes[root].flags.has_call() {
            self.blocks[block].has_call = true;
        }
        self.blocks[block].stmts.push(stmt);
        stmt
    }

    /// The nodes of `root`'s tree in execution order: children before
    /// parents, left to right.
    pub fn tree_postorder(&self, root: Node) -> Vec<Node> {
        let mut out = Vec::new();
        let mut stack: SmallVec<[(Node, bool); 16]> = smallvec![(root, false)];
        while let Some((n, expanded)) = stack.pop() {
            if expanded {
                out.push(n);
                continue;
            }
            stack.push((n, true));
            for arg in self.nodes[n].args.iter().rev() {
                if let Some(a) = arg.expand() {
                    stack.push((a, false));
                }
            }
        }
        out
    }

    /// Execution order of a whole statement.
    pub fn stmt_postorder(&self, stmt: Stmt) -> Vec<Node> {
        self.tree_postorder(self.stmts[stmt].root)
    }

    /// Locate the link through which `target` hangs in `stmt`.
    pub fn find_link(&self, stmt: Stmt, target: Node) -> Option<NodeLink> {
        if self.stmts[stmt].root == target {
            return Some(NodeLink::Root(stmt));
        }
        for n in self.stmt_postorder(stmt) {
            for (i, arg) in self.nodes[n].args.iter().enumerate() {
                if arg.expand() == Some(target) {
                    return Some(NodeLink::Arg(n, i));
                }
            }
        }
        None
    }

    /// Redirect `link` to `new_node`.
    pub fn replace_link(&mut self, link: NodeLink, new_node: Node) {
        match link {
            NodeLink::Root(stmt) => self.stmts[stmt].root = new_node,
            NodeLink::Arg(parent, i) => self.nodes[parent].args[i] = new_node.into(),
        }
    }

    /// Override the cost estimates of a node.
    pub fn set_costs(&mut self, node: Node, cost_ex: u16, cost_sz: u16) {
        let data = &mut self.nodes[node];
        data.cost_ex = cost_ex;
        data.cost_sz = cost_sz;
    }
}
