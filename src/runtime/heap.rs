use thiserror::Error;

/// Handle to a heap cell. Index 0 is the permanent [`NodeRef::NIL`] sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeRef(u32);

impl NodeRef {
    pub const NIL: NodeRef = NodeRef(0);

    pub fn from_index(index: usize) -> Self {
        NodeRef(index as u32)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn is_nil(self) -> bool {
        self == NodeRef::NIL
    }
}

impl std::fmt::Display for NodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    White,
    Grey,
    Black,
}

/// Contents of one heap cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Node {
    /// The sentinel at index 0.
    Nil,

    /// Free-list link.
    Free { next: NodeRef },

    Number(f64),
    Bool(bool),
    Undefined,

    /// Operand-stack cell. The base sentinel of a stack has `below == NIL`.
    OsCell { below: NodeRef, value: NodeRef },

    /// Environment frame: `size` bindings starting at `first`.
    EnvFrame { size: usize, first: NodeRef },

    /// One environment slot. A `NIL` value reads as undefined.
    Binding { next: NodeRef, value: NodeRef },

    Closure {
        address: usize,
        env_extension: usize,
        max_stack: usize,
        env: NodeRef,
    },

    /// Saved caller state pushed by CALL and consumed by RTN.
    RtsFrame {
        resume_pc: usize,
        os: NodeRef,
        env: NodeRef,
    },
}

impl Node {
    /// Handles this cell points to. The collector traverses only these.
    pub fn children(&self) -> impl Iterator<Item = NodeRef> {
        let pair = match *self {
            Node::Free { next } => [Some(next), None],
            Node::OsCell { below, value } => [Some(below), Some(value)],
            Node::EnvFrame { first, .. } => [Some(first), None],
            Node::Binding { next, value } => [Some(next), Some(value)],
            Node::Closure { env, .. } => [Some(env), None],
            Node::RtsFrame { os, env, .. } => [Some(os), Some(env)],
            Node::Nil | Node::Number(_) | Node::Bool(_) | Node::Undefined => [None, None],
        };
        pair.into_iter().flatten()
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Node::Nil => "nil",
            Node::Free { .. } => "free",
            Node::Number(_) => "number",
            Node::Bool(_) => "boolean",
            Node::Undefined => "undefined",
            Node::OsCell { .. } => "operand stack cell",
            Node::EnvFrame { .. } => "environment frame",
            Node::Binding { .. } => "binding",
            Node::Closure { .. } => "function",
            Node::RtsFrame { .. } => "return frame",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum HeapError {
    #[error("heap exhausted")]
    Exhausted,

    #[error("free list is corrupt at {0}")]
    CorruptFreeList(NodeRef),

    #[error("heap needs at least 2 nodes, got {0}")]
    TooSmall(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub capacity: usize,
    pub free: usize,
    pub live: usize,
    pub grey: usize,
}

/// Fixed-size arena of uniform cells with a threaded free list.
///
/// Every cell carries a tri-color mark. The heap itself enforces the
/// insertion write barrier: [`Heap::allocate`] and [`Heap::write`] shade
/// every handle they store, so a black cell never ends up pointing at a
/// white one. It also keeps an exact count of grey cells, which the
/// collector uses to decide when marking is finished.
pub struct Heap {
    nodes: Vec<Node>,
    colors: Vec<Color>,
    free: NodeRef,
    free_left: usize,
    grey_count: usize,
}

/// The sentinel plus one usable cell.
pub const MIN_CAPACITY: usize = 2;

impl Heap {
    /// A heap of `capacity` cells, including the sentinel.
    pub fn new(capacity: usize) -> Result<Self, HeapError> {
        if capacity < MIN_CAPACITY {
            return Err(HeapError::TooSmall(capacity));
        }

        let mut nodes = Vec::with_capacity(capacity);
        nodes.push(Node::Nil);
        for i in 1..capacity {
            let next = if i + 1 < capacity {
                NodeRef::from_index(i + 1)
            } else {
                NodeRef::NIL
            };
            nodes.push(Node::Free { next });
        }

        let mut colors = vec![Color::White; capacity];
        colors[0] = Color::Black;

        Ok(Self {
            nodes,
            colors,
            free: NodeRef::from_index(1),
            free_left: capacity - 1,
            grey_count: 0,
        })
    }

    /// Take the head of the free list and store `node` in it.
    ///
    /// The fresh cell, the new free head and the children of `node` are all
    /// shaded.
    pub fn allocate(&mut self, node: Node) -> Result<NodeRef, HeapError> {
        let cell = self.free;
        if cell.is_nil() {
            return Err(HeapError::Exhausted);
        }
        let Node::Free { next } = self.nodes[cell.index()] else {
            return Err(HeapError::CorruptFreeList(cell));
        };

        self.free = next;
        self.free_left -= 1;
        self.shade(next);

        self.write(cell, node);
        self.shade(cell);
        Ok(cell)
    }

    pub fn get(&self, node: NodeRef) -> Node {
        self.nodes[node.index()]
    }

    /// Overwrite a cell, shading the handles it now holds.
    pub fn write(&mut self, node: NodeRef, contents: Node) {
        for child in contents.children() {
            self.shade(child);
        }
        self.nodes[node.index()] = contents;
    }

    /// Return a cell to the free list. The cell becomes white.
    pub fn release(&mut self, node: NodeRef) {
        if node.is_nil() {
            return;
        }
        self.nodes[node.index()] = Node::Free { next: self.free };
        self.free = node;
        self.free_left += 1;
        self.whiten(node);
    }

    pub fn color(&self, node: NodeRef) -> Color {
        self.colors[node.index()]
    }

    /// White becomes grey; other colors are left alone.
    pub fn shade(&mut self, node: NodeRef) {
        let color = &mut self.colors[node.index()];
        if *color == Color::White {
            *color = Color::Grey;
            self.grey_count += 1;
        }
    }

    pub fn blacken(&mut self, node: NodeRef) {
        self.set_color(node, Color::Black);
    }

    /// Reset a cell to white. The sentinel stays black.
    pub fn whiten(&mut self, node: NodeRef) {
        if !node.is_nil() {
            self.set_color(node, Color::White);
        }
    }

    fn set_color(&mut self, node: NodeRef, color: Color) {
        let slot = &mut self.colors[node.index()];
        if *slot == Color::Grey {
            self.grey_count -= 1;
        }
        if color == Color::Grey {
            self.grey_count += 1;
        }
        *slot = color;
    }

    /// Every cell white except the sentinel.
    pub fn clear_colors(&mut self) {
        self.colors.fill(Color::White);
        self.colors[0] = Color::Black;
        self.grey_count = 0;
    }

    pub fn free_head(&self) -> NodeRef {
        self.free
    }

    pub fn free_left(&self) -> usize {
        self.free_left
    }

    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    pub fn grey_count(&self) -> usize {
        self.grey_count
    }

    /// Cells in use, not counting the sentinel.
    pub fn live_count(&self) -> usize {
        self.capacity() - 1 - self.free_left
    }

    pub fn is_free(&self, node: NodeRef) -> bool {
        matches!(self.nodes[node.index()], Node::Free { .. })
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            capacity: self.capacity(),
            free: self.free_left,
            live: self.live_count(),
            grey: self.grey_count,
        }
    }

    /// Handles of every cell, sentinel excluded.
    pub fn cells(&self) -> impl Iterator<Item = NodeRef> + use<> {
        (1..self.nodes.len()).map(NodeRef::from_index)
    }
}
