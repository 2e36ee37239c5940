use crate::runtime::heap::{Color, Heap, NodeRef};
use std::collections::VecDeque;

/// Where the incremental collector is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Next step shades the roots.
    MarkRoots,

    /// Scanning for grey cells. `miss_count` counts consecutive cells found
    /// non-grey; a full lap of misses with no grey cell left ends marking.
    Mark { index: usize, miss_count: usize },

    /// Reclaiming white cells from `index` upwards.
    Sweep { index: usize },
}

/// The machine registers the collector treats as roots, besides the free
/// list head.
#[derive(Debug, Clone, Copy)]
pub struct Roots<'a> {
    pub os: NodeRef,
    pub env: NodeRef,
    pub rts: &'a [NodeRef],
}

impl Roots<'_> {
    pub fn iter(&self) -> impl Iterator<Item = NodeRef> + '_ {
        [self.os, self.env].into_iter().chain(self.rts.iter().copied())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectorStats {
    pub steps: usize,
    pub cycles: usize,
    pub stop_the_world: usize,
    pub marked: usize,
    pub freed: usize,
}

/// Incremental tri-color mark and sweep collector.
///
/// Each [`Collector::step`] does a bounded amount of work so it can be
/// interleaved with mutator instructions. Correctness relies on the heap's
/// insertion barrier and on the machine shading every handle it moves into a
/// register.
#[derive(Debug, Clone)]
pub struct Collector {
    phase: Phase,
    mark_batch: usize,
    sweep_batch: usize,
    stats: CollectorStats,
}

impl Collector {
    pub fn new(mark_batch: usize, sweep_batch: usize) -> Self {
        Self {
            phase: Phase::MarkRoots,
            mark_batch: mark_batch.max(1),
            sweep_batch: sweep_batch.max(1),
            stats: CollectorStats::default(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn stats(&self) -> &CollectorStats {
        &self.stats
    }

    /// Advance the current phase by one bounded step.
    pub fn step(&mut self, heap: &mut Heap, roots: &Roots) {
        self.stats.steps += 1;

        self.phase = match self.phase {
            Phase::MarkRoots => {
                shade_roots(heap, roots);
                log::debug!("gc: roots shaded, {} grey", heap.grey_count());
                Phase::Mark {
                    index: 0,
                    miss_count: 0,
                }
            }
            Phase::Mark { index, miss_count } => self.mark(heap, index, miss_count),
            Phase::Sweep { index } => self.sweep(heap, index),
        };
    }

    fn mark(&mut self, heap: &mut Heap, mut index: usize, mut miss_count: usize) -> Phase {
        let capacity = heap.capacity();

        for _ in 0..self.mark_batch {
            let cell = NodeRef::from_index(index);
            if heap.color(cell) == Color::Grey {
                let node = heap.get(cell);
                heap.blacken(cell);
                for child in node.children() {
                    heap.shade(child);
                }
                self.stats.marked += 1;
                miss_count = 0;
            } else {
                miss_count += 1;
            }
            index = (index + 1) % capacity;

            if miss_count >= capacity && heap.grey_count() == 0 {
                log::debug!("gc: marking done, sweeping");
                return Phase::Sweep { index: 1 };
            }
        }

        Phase::Mark { index, miss_count }
    }

    /// Black cells survive and turn white for the next cycle, white cells
    /// are reclaimed, grey cells (allocated since marking ended) survive.
    fn sweep(&mut self, heap: &mut Heap, mut index: usize) -> Phase {
        for _ in 0..self.sweep_batch {
            if index >= heap.capacity() {
                self.stats.cycles += 1;
                log::debug!(
                    "gc: cycle {} done, {} free",
                    self.stats.cycles,
                    heap.free_left()
                );
                return Phase::MarkRoots;
            }

            let cell = NodeRef::from_index(index);
            match heap.color(cell) {
                Color::Black => heap.whiten(cell),
                Color::White => {
                    heap.release(cell);
                    self.stats.freed += 1;
                }
                Color::Grey => {}
            }
            index += 1;
        }

        Phase::Sweep { index }
    }

    /// Run steps until the current cycle finishes.
    ///
    /// From `MarkRoots` this runs a whole cycle; from the middle of a cycle
    /// it completes that one.
    pub fn full_cycle(&mut self, heap: &mut Heap, roots: &Roots) {
        if self.phase == Phase::MarkRoots {
            self.step(heap, roots);
        }
        while self.phase != Phase::MarkRoots {
            self.step(heap, roots);
        }
    }

    /// Collect synchronously, abandoning any incremental cycle in progress.
    ///
    /// Marks breadth-first from the roots, frees every unmarked cell, then
    /// leaves all cells white and the collector at `MarkRoots`.
    pub fn stop_the_world(&mut self, heap: &mut Heap, roots: &Roots) {
        let free_before = heap.free_left();
        heap.clear_colors();

        let mut queue = VecDeque::new();
        for root in roots.iter().chain([heap.free_head()]) {
            if heap.color(root) == Color::White {
                heap.blacken(root);
                queue.push_back(root);
            }
        }
        while let Some(cell) = queue.pop_front() {
            for child in heap.get(cell).children() {
                if heap.color(child) == Color::White {
                    heap.blacken(child);
                    queue.push_back(child);
                }
            }
        }

        for cell in heap.cells() {
            if heap.color(cell) == Color::White {
                heap.release(cell);
            }
        }
        heap.clear_colors();

        let freed = heap.free_left() - free_before;
        self.stats.freed += freed;
        self.stats.stop_the_world += 1;
        self.phase = Phase::MarkRoots;
        log::debug!(
            "gc: stop-the-world freed {} cells, {} free",
            freed,
            heap.free_left()
        );
    }
}

fn shade_roots(heap: &mut Heap, roots: &Roots) {
    heap.shade(heap.free_head());
    for root in roots.iter() {
        heap.shade(root);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::heap::Node;
    use crate::runtime::structures::{alloc_number, new_environment, new_operand_stack, push_operand};

    /// An operand stack holding one number, plus one garbage number.
    fn setup(heap: &mut Heap) -> (NodeRef, NodeRef, NodeRef) {
        let base = new_operand_stack(heap).unwrap();
        let live = alloc_number(heap, 1.0).unwrap();
        let os = push_operand(heap, base, live).unwrap();
        let garbage = alloc_number(heap, 2.0).unwrap();
        (os, live, garbage)
    }

    fn env(heap: &mut Heap) -> NodeRef {
        new_environment(heap, 0).unwrap()
    }

    #[test]
    fn test_incremental_cycle_frees_garbage_only() {
        let mut heap = Heap::new(16).unwrap();
        let (os, live, garbage) = setup(&mut heap);
        let env = env(&mut heap);
        let roots = Roots { os, env, rts: &[] };

        let mut gc = Collector::new(3, 3);
        // the first cycle only whitens what allocation shaded
        gc.full_cycle(&mut heap, &roots);
        gc.full_cycle(&mut heap, &roots);

        assert!(heap.is_free(garbage));
        assert!(!heap.is_free(live));
        assert!(!heap.is_free(os));
        assert!(!heap.is_free(env));
        assert_eq!(gc.phase(), Phase::MarkRoots);
        assert_eq!(gc.stats().cycles, 2);
    }

    #[test]
    fn test_cycle_without_mutation_keeps_reachable_cells() {
        let mut heap = Heap::new(16).unwrap();
        let (os, live, _) = setup(&mut heap);
        let env = env(&mut heap);
        let roots = Roots { os, env, rts: &[] };

        let mut gc = Collector::new(4, 4);
        gc.full_cycle(&mut heap, &roots);
        gc.full_cycle(&mut heap, &roots);
        let snapshot: Vec<Node> = [os, live, env].iter().map(|&r| heap.get(r)).collect();
        let free_after_two = heap.free_left();

        gc.full_cycle(&mut heap, &roots);
        let again: Vec<Node> = [os, live, env].iter().map(|&r| heap.get(r)).collect();
        assert_eq!(snapshot, again);
        assert_eq!(heap.free_left(), free_after_two);
    }

    #[test]
    fn test_stop_the_world() {
        let mut heap = Heap::new(16).unwrap();
        let (os, live, garbage) = setup(&mut heap);
        let env = env(&mut heap);
        let free_before = heap.free_left();

        let mut gc = Collector::new(1, 1);
        gc.step(&mut heap, &Roots { os, env, rts: &[] });
        gc.stop_the_world(&mut heap, &Roots { os, env, rts: &[] });

        assert!(heap.is_free(garbage));
        assert!(!heap.is_free(live));
        assert_eq!(heap.free_left(), free_before + 1);
        assert_eq!(heap.grey_count(), 0);
        assert_eq!(gc.phase(), Phase::MarkRoots);
        assert_eq!(gc.stats().stop_the_world, 1);
    }

    #[test]
    fn test_rts_frames_are_roots() {
        let mut heap = Heap::new(16).unwrap();
        let saved_os = new_operand_stack(&mut heap).unwrap();
        let saved_env = env(&mut heap);
        let frame = heap
            .allocate(Node::RtsFrame {
                resume_pc: 3,
                os: saved_os,
                env: saved_env,
            })
            .unwrap();
        let os = new_operand_stack(&mut heap).unwrap();
        let env = env(&mut heap);

        let mut gc = Collector::new(8, 8);
        gc.stop_the_world(&mut heap, &Roots { os, env, rts: &[frame] });
        assert!(!heap.is_free(frame));
        assert!(!heap.is_free(saved_os));
        assert!(!heap.is_free(saved_env));

        gc.stop_the_world(&mut heap, &Roots { os, env, rts: &[] });
        assert!(heap.is_free(frame));
        assert!(heap.is_free(saved_os));
    }

    #[test]
    fn test_allocation_during_sweep_survives() {
        let mut heap = Heap::new(32).unwrap();
        let (os, _, _) = setup(&mut heap);
        let env = env(&mut heap);
        let roots = Roots { os, env, rts: &[] };

        let mut gc = Collector::new(64, 1);
        gc.full_cycle(&mut heap, &roots);
        while !matches!(gc.phase(), Phase::Sweep { .. }) {
            gc.step(&mut heap, &roots);
        }

        let fresh = alloc_number(&mut heap, 9.0).unwrap();
        assert_eq!(heap.color(fresh), Color::Grey);
        gc.full_cycle(&mut heap, &roots);
        // unreachable, but allocated after marking ended
        assert!(!heap.is_free(fresh));
        gc.full_cycle(&mut heap, &roots);
        gc.full_cycle(&mut heap, &roots);
        assert!(heap.is_free(fresh));
    }

    #[test]
    fn test_nil_is_never_swept() {
        let mut heap = Heap::new(4).unwrap();
        let mut gc = Collector::new(2, 2);
        let roots = Roots {
            os: NodeRef::NIL,
            env: NodeRef::NIL,
            rts: &[],
        };
        gc.full_cycle(&mut heap, &roots);
        gc.stop_the_world(&mut heap, &roots);
        assert_eq!(heap.get(NodeRef::NIL), Node::Nil);
        assert_eq!(heap.color(NodeRef::NIL), Color::Black);
        assert_eq!(heap.free_left(), 3);
    }
}
