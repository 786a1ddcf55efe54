// Purpose: Schedule visitors over the graph in waves with bounded parallelism.
// Inputs/Outputs: Runs Visitor callbacks with an exclusive borrow of each node.
// Invariants: A node runs only after all direction-appropriate neighbors have run.
// Gotchas: Visitors may lock already-visited neighbor slots, never unvisited ones.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use anyhow::{Result, anyhow};
use parking_lot::{Condvar, Mutex};

use super::node::{Node, NodeId};
use super::{Dag, DagState};

/// Cooperative cancellation shared by every task in a wave. Checked at
/// suspension points: before scheduling, before process spawns, inside IO
/// loops.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn bail_if_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(anyhow!("cancelled"));
        }
        Ok(())
    }
}

pub struct VisitCx<'a> {
    pub dag: &'a Dag,
    pub cancel: &'a CancelToken,
}

pub trait Visitor: Sync {
    fn visit(&self, cx: &VisitCx<'_>, node: &mut Node) -> Result<()>;
}

impl<F> Visitor for F
where
    F: Fn(&VisitCx<'_>, &mut Node) -> Result<()> + Sync,
{
    fn visit(&self, cx: &VisitCx<'_>, node: &mut Node) -> Result<()> {
        self(cx, node)
    }
}

/// Which neighbor set gates readiness. `Left` gates on imports (bottom-up),
/// `Right` gates on dependents (top-down), matching the traversal that
/// starts from the opposite side.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Left,
    Right,
}

impl Dag {
    /// Visit every node bottom-up: a node runs once all of its imports have
    /// run. Within one wave all scheduled nodes run in parallel.
    pub fn visit_all_from_right(
        &self,
        cancel: &CancelToken,
        visitor: &(impl Visitor + ?Sized),
    ) -> Result<()> {
        let pass: Vec<NodeId> = {
            let state = self.state.lock();
            state.right_leaf.iter().copied().collect()
        };
        self.wave_visit(cancel, visitor, pass, Direction::Left)
    }

    /// Visit every node top-down: a node runs once all of its dependents
    /// have run.
    pub fn visit_all_from_left(
        &self,
        cancel: &CancelToken,
        visitor: &(impl Visitor + ?Sized),
    ) -> Result<()> {
        let pass: Vec<NodeId> = {
            let state = self.state.lock();
            state.left_leaf.iter().copied().collect()
        };
        self.wave_visit(cancel, visitor, pass, Direction::Right)
    }

    /// Visit every node in no particular order, at most `concurrency` at a
    /// time.
    pub fn visit_all(
        &self,
        cancel: &CancelToken,
        visitor: &(impl Visitor + ?Sized),
        concurrency: usize,
    ) -> Result<()> {
        let concurrency = concurrency.max(1);
        let ids = self.node_ids();
        let semaphore = Semaphore::new(concurrency);
        let first_error: Mutex<Option<anyhow::Error>> = Mutex::new(None);

        thread::scope(|scope| {
            for id in ids {
                if cancel.is_cancelled() {
                    break;
                }
                semaphore.acquire();
                let slot = self.handle(id);
                let semaphore = &semaphore;
                let first_error = &first_error;
                let visitor = &visitor;
                scope.spawn(move || {
                    let outcome = {
                        let mut node = slot.write();
                        let cx = VisitCx { dag: self, cancel };
                        visitor.visit(&cx, &mut node)
                    };
                    if let Err(err) = outcome {
                        cancel.cancel();
                        let mut guard = first_error.lock();
                        if guard.is_none() {
                            *guard = Some(err);
                        }
                    }
                    semaphore.release();
                });
            }
        });

        match first_error.into_inner() {
            Some(err) => Err(err),
            None => cancel.bail_if_cancelled(),
        }
    }

    fn wave_visit(
        &self,
        cancel: &CancelToken,
        visitor: &(impl Visitor + ?Sized),
        mut pass: Vec<NodeId>,
        direction: Direction,
    ) -> Result<()> {
        let mut already_added: std::collections::HashSet<NodeId> = pass.iter().copied().collect();
        let mut already_visited: std::collections::HashSet<NodeId> = Default::default();

        loop {
            if pass.is_empty() {
                return Ok(());
            }
            cancel.bail_if_cancelled()?;

            let mut this_pass = Vec::new();
            let mut next_pass = Vec::new();
            for id in pass {
                if self.ready(id, direction, &already_visited) {
                    this_pass.push(id);
                } else {
                    next_pass.push(id);
                }
            }

            if this_pass.is_empty() {
                // Every remaining node is waiting on another remaining node;
                // only a cycle that escaped repair can cause this.
                return Err(anyhow!("traversal stalled with {} nodes unvisited", next_pass.len()));
            }

            let first_error: Mutex<Option<anyhow::Error>> = Mutex::new(None);
            thread::scope(|scope| {
                for &id in &this_pass {
                    let slot = self.handle(id);
                    let first_error = &first_error;
                    let visitor = &visitor;
                    scope.spawn(move || {
                        if cancel.is_cancelled() {
                            return;
                        }
                        let outcome = {
                            let mut node = slot.write();
                            let cx = VisitCx { dag: self, cancel };
                            visitor.visit(&cx, &mut node)
                        };
                        if let Err(err) = outcome {
                            cancel.cancel();
                            let mut guard = first_error.lock();
                            if guard.is_none() {
                                *guard = Some(err);
                            }
                        }
                    });
                }
            });
            if let Some(err) = first_error.into_inner() {
                return Err(err);
            }
            cancel.bail_if_cancelled()?;

            let state = self.state.lock();
            for &id in &this_pass {
                already_visited.insert(id);
                self.enqueue_neighbors(&state, id, direction, &mut already_added, &mut next_pass);
            }
            drop(state);

            pass = next_pass;
        }
    }

    fn ready(
        &self,
        id: NodeId,
        direction: Direction,
        already_visited: &std::collections::HashSet<NodeId>,
    ) -> bool {
        let slot = self.handle(id);
        let node = slot.read();
        match direction {
            Direction::Left => match &node.bits {
                Some(bits) => bits
                    .imports
                    .iter()
                    .all(|edge| already_visited.contains(&edge.node)),
                None => true,
            },
            Direction::Right => {
                if node.bits.is_none() {
                    return true;
                }
                node.deps.iter().all(|dep| already_visited.contains(dep))
            }
        }
    }

    fn enqueue_neighbors(
        &self,
        state: &DagState,
        id: NodeId,
        direction: Direction,
        already_added: &mut std::collections::HashSet<NodeId>,
        next_pass: &mut Vec<NodeId>,
    ) {
        let slot = state.slot(id);
        let node = slot.read();
        match direction {
            Direction::Left => {
                for &dep in &node.deps {
                    if already_added.contains(&dep) {
                        continue;
                    }
                    let dep_slot = state.slot(dep);
                    if state.table.get(&dep_slot.read().key) != Some(&dep) {
                        continue;
                    }
                    already_added.insert(dep);
                    next_pass.push(dep);
                }
            }
            Direction::Right => {
                let Some(bits) = &node.bits else {
                    return;
                };
                for edge in &bits.imports {
                    if already_added.contains(&edge.node) {
                        continue;
                    }
                    let imp_slot = state.slot(edge.node);
                    if state.table.get(&imp_slot.read().key) != Some(&edge.node) {
                        continue;
                    }
                    already_added.insert(edge.node);
                    next_pass.push(edge.node);
                }
            }
        }
    }
}

/// Counting semaphore gating `visit_all` parallelism.
struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            available: Condvar::new(),
        }
    }

    fn acquire(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.available.wait(&mut permits);
        }
        *permits -= 1;
    }

    fn release(&self) {
        let mut permits = self.permits.lock();
        *permits += 1;
        self.available.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::pkg;
    use super::{CancelToken, VisitCx};
    use crate::dag::{Dag, Node};
    use anyhow::anyhow;
    use parking_lot::Mutex;

    fn diamond() -> Dag {
        let d = Dag::new();
        d.add(&pkg("a", &["b", "c"]), false, false).expect("a");
        d.add(&pkg("b", &["d"]), false, false).expect("b");
        d.add(&pkg("c", &["d"]), false, false).expect("c");
        d.add(&pkg("d", &[]), false, false).expect("d");
        d
    }

    fn visit_order_from_right(d: &Dag) -> Vec<String> {
        let order = Mutex::new(Vec::new());
        d.visit_all_from_right(&CancelToken::new(), &|_: &VisitCx, n: &mut Node| -> anyhow::Result<()> {
            order.lock().push(n.import_path.clone());
            Ok(())
        })
        .expect("visit");
        order.into_inner()
    }

    #[test]
    fn right_visit_runs_imports_before_importers() {
        let d = diamond();
        let order = visit_order_from_right(&d);
        let pos = |name: &str| order.iter().position(|v| v == name).expect("visited");
        assert!(pos("d") < pos("b"));
        assert!(pos("d") < pos("c"));
        assert!(pos("b") < pos("a"));
        assert!(pos("c") < pos("a"));
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn left_visit_runs_dependents_first() {
        let d = diamond();
        let order = Mutex::new(Vec::new());
        d.visit_all_from_left(&CancelToken::new(), &|_: &VisitCx, n: &mut Node| -> anyhow::Result<()> {
            order.lock().push(n.import_path.clone());
            Ok(())
        })
        .expect("visit");
        let order = order.into_inner();
        let pos = |name: &str| order.iter().position(|v| v == name).expect("visited");
        assert!(pos("a") < pos("b"));
        assert!(pos("a") < pos("c"));
        assert!(pos("b") < pos("d"));
        assert!(pos("c") < pos("d"));
    }

    #[test]
    fn failure_cancels_the_wave() {
        let d = diamond();
        let err = d
            .visit_all_from_right(&CancelToken::new(), &|_: &VisitCx, n: &mut Node| -> anyhow::Result<()> {
                if n.import_path == "d" {
                    return Err(anyhow!("boom"));
                }
                Ok(())
            })
            .expect_err("must fail");
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn visit_all_sees_every_node_with_small_concurrency() {
        let d = diamond();
        let seen = Mutex::new(Vec::new());
        d.visit_all(
            &CancelToken::new(),
            &|_: &VisitCx, n: &mut Node| -> anyhow::Result<()> {
                seen.lock().push(n.import_path.clone());
                Ok(())
            },
            2,
        )
        .expect("visit");
        let mut seen = seen.into_inner();
        seen.sort();
        assert_eq!(seen, vec!["a", "b", "c", "d"]);
    }
}
