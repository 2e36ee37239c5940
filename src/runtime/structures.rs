//! Machine data structures built out of heap cells.
//!
//! Operand stacks are linked lists of [`Node::OsCell`] ending in a base
//! sentinel; environments are an [`Node::EnvFrame`] heading a list of
//! [`Node::Binding`]s. Every function here allocates at most the number of
//! cells documented on it, which is what the machine's admission control
//! budgets for.

use crate::lang::value::Value;
use crate::runtime::heap::{Heap, HeapError, Node, NodeRef};
use crate::runtime::runtime_error::{RuntimeError, type_mismatch};

// =============================================================================
// Operand stack
// =============================================================================

/// A fresh, empty operand stack. One cell.
pub fn new_operand_stack(heap: &mut Heap) -> Result<NodeRef, HeapError> {
    heap.allocate(Node::OsCell {
        below: NodeRef::NIL,
        value: NodeRef::NIL,
    })
}

/// Push `value`, returning the new top. One cell.
pub fn push_operand(heap: &mut Heap, os: NodeRef, value: NodeRef) -> Result<NodeRef, HeapError> {
    heap.allocate(Node::OsCell { below: os, value })
}

/// Pop the top of `os`, returning `(new_top, value)`.
///
/// Both returned handles are shaded: once the caller holds them in
/// registers the popped cell no longer keeps them reachable.
pub fn pop_operand(heap: &mut Heap, os: NodeRef) -> Result<(NodeRef, NodeRef), RuntimeError> {
    match heap.get(os) {
        Node::OsCell { below, value } if !below.is_nil() => {
            heap.shade(below);
            heap.shade(value);
            Ok((below, value))
        }
        _ => Err(RuntimeError::OperandStackUnderflow),
    }
}

/// Top value of `os`, if the stack is not empty.
pub fn peek_operand(heap: &Heap, os: NodeRef) -> Option<NodeRef> {
    match heap.get(os) {
        Node::OsCell { below, value } if !below.is_nil() => Some(value),
        _ => None,
    }
}

// =============================================================================
// Values
// =============================================================================

pub fn alloc_number(heap: &mut Heap, n: f64) -> Result<NodeRef, HeapError> {
    heap.allocate(Node::Number(n))
}

pub fn alloc_bool(heap: &mut Heap, b: bool) -> Result<NodeRef, HeapError> {
    heap.allocate(Node::Bool(b))
}

pub fn alloc_undefined(heap: &mut Heap) -> Result<NodeRef, HeapError> {
    heap.allocate(Node::Undefined)
}

/// Host view of a value cell. `NIL` (an unassigned binding) reads as
/// undefined.
pub fn read_value(heap: &Heap, node: NodeRef) -> Result<Value, RuntimeError> {
    match heap.get(node) {
        Node::Nil | Node::Undefined => Ok(Value::Undefined),
        Node::Number(n) => Ok(Value::Number(n)),
        Node::Bool(b) => Ok(Value::Bool(b)),
        Node::Closure {
            address,
            env_extension,
            ..
        } => Ok(Value::Closure {
            address,
            env_extension,
        }),
        other => Err(type_mismatch("read", "value", other.kind())),
    }
}

pub fn new_closure(
    heap: &mut Heap,
    address: usize,
    env_extension: usize,
    max_stack: usize,
    env: NodeRef,
) -> Result<NodeRef, HeapError> {
    heap.allocate(Node::Closure {
        address,
        env_extension,
        max_stack,
        env,
    })
}

// =============================================================================
// Environments
// =============================================================================

fn frame(heap: &Heap, env: NodeRef) -> Result<(usize, NodeRef), RuntimeError> {
    match heap.get(env) {
        Node::EnvFrame { size, first } => Ok((size, first)),
        other => Err(type_mismatch("environment", "environment frame", other.kind())),
    }
}

/// Build a binding list of `count` unassigned slots ending in `tail`.
/// `count` cells.
fn new_bindings(heap: &mut Heap, count: usize, tail: NodeRef) -> Result<NodeRef, HeapError> {
    let mut first = tail;
    for _ in 0..count {
        first = heap.allocate(Node::Binding {
            next: first,
            value: NodeRef::NIL,
        })?;
    }
    Ok(first)
}

/// A frame with `size` unassigned slots. `size + 1` cells.
pub fn new_environment(heap: &mut Heap, size: usize) -> Result<NodeRef, HeapError> {
    let first = new_bindings(heap, size, NodeRef::NIL)?;
    heap.allocate(Node::EnvFrame { size, first })
}

pub fn environment_size(heap: &Heap, env: NodeRef) -> Result<usize, RuntimeError> {
    frame(heap, env).map(|(size, _)| size)
}

/// Handle of the binding cell for `slot`.
fn binding(heap: &Heap, env: NodeRef, slot: usize) -> Result<NodeRef, RuntimeError> {
    let (size, first) = frame(heap, env)?;
    if slot >= size {
        return Err(RuntimeError::UnboundSlot { slot, size });
    }
    let mut cursor = first;
    for _ in 0..slot {
        match heap.get(cursor) {
            Node::Binding { next, .. } => cursor = next,
            other => return Err(type_mismatch("environment", "binding", other.kind())),
        }
    }
    Ok(cursor)
}

/// Store `value` in `slot`, in place.
pub fn bind(heap: &mut Heap, env: NodeRef, slot: usize, value: NodeRef) -> Result<(), RuntimeError> {
    let cell = binding(heap, env, slot)?;
    match heap.get(cell) {
        Node::Binding { next, .. } => {
            heap.write(cell, Node::Binding { next, value });
            Ok(())
        }
        other => Err(type_mismatch("environment", "binding", other.kind())),
    }
}

/// Value handle in `slot`. `NIL` when the slot was never assigned.
pub fn lookup(heap: &Heap, env: NodeRef, slot: usize) -> Result<NodeRef, RuntimeError> {
    match heap.get(binding(heap, env, slot)?) {
        Node::Binding { value, .. } => Ok(value),
        other => Err(type_mismatch("environment", "binding", other.kind())),
    }
}

/// Append `count` unassigned slots to `env`, in place. `count` cells.
pub fn add_bindings(heap: &mut Heap, env: NodeRef, count: usize) -> Result<(), RuntimeError> {
    if count == 0 {
        return Ok(());
    }
    let (size, first) = frame(heap, env)?;
    let extra = new_bindings(heap, count, NodeRef::NIL)?;

    if size == 0 {
        heap.write(env, Node::EnvFrame {
            size: count,
            first: extra,
        });
        return Ok(());
    }

    let last = binding(heap, env, size - 1)?;
    if let Node::Binding { value, .. } = heap.get(last) {
        heap.write(last, Node::Binding { next: extra, value });
    }
    heap.write(env, Node::EnvFrame {
        size: size + count,
        first,
    });
    Ok(())
}

/// A new frame holding copies of `base`'s slots followed by `ext`'s slots.
///
/// `base` is left untouched. The slots of `ext` are shared, not copied.
/// `size(base) + 1` cells.
pub fn extend(heap: &mut Heap, base: NodeRef, ext: NodeRef) -> Result<NodeRef, RuntimeError> {
    let (base_size, base_first) = frame(heap, base)?;
    let (ext_size, ext_first) = frame(heap, ext)?;

    let mut values = Vec::with_capacity(base_size);
    let mut cursor = base_first;
    for _ in 0..base_size {
        match heap.get(cursor) {
            Node::Binding { next, value } => {
                values.push(value);
                cursor = next;
            }
            other => return Err(type_mismatch("environment", "binding", other.kind())),
        }
    }

    let mut first = ext_first;
    for value in values.into_iter().rev() {
        first = heap.allocate(Node::Binding { next: first, value })?;
    }
    Ok(heap.allocate(Node::EnvFrame {
        size: base_size + ext_size,
        first,
    })?)
}
