// Purpose: Detect import cycles and repair test-induced ones by package cloning.
// Inputs/Outputs: Walks imports depth-first; splits cyclic packages into compile and isolated variants.
// Invariants: After repair the graph restricted to non-test edges is acyclic.
// Gotchas: Detection flags are generation-scoped; a back edge only counts when it reaches the start node.

use anyhow::Result;
use log::info;

use super::Dag;
use super::node::{ImportEdge, LinkMode, NodeId, NodeKey};
use crate::errors::{CyclePath, Error};

/// A cycle found by the walk, tagged with whether any edge on it is
/// test-only. Test-tainted cycles are repairable; pure import cycles are
/// fatal.
struct CycleHit {
    path: CyclePath,
    via_test: bool,
}

impl Dag {
    /// Depth-first cycle check over import edges, starting from every node.
    /// A cycle that includes a test-only edge marks its start node for
    /// isolation and detection continues; every node on such a cycle is a
    /// start node in some iteration, so all of them end up marked. Cycles
    /// made purely of production edges are fatal, reported with the full
    /// path. Marked nodes are then cloned, breaking the cycles.
    pub fn check_for_cycles(&self) -> Result<()> {
        let ids = self.node_ids();
        let mut cycle_errors: Vec<CyclePath> = Vec::new();

        for id in ids.iter().copied() {
            let generation = {
                let mut state = self.state.lock();
                state.flag_generation += 1;
                state.flag_generation
            };
            let (import_path, edges) = {
                let slot = self.handle(id);
                let node = slot.read();
                (node.import_path.clone(), edges_of(&node))
            };
            for edge in edges {
                if let Err(mut hit) = self.walk_for_cycles(id, edge, generation) {
                    hit.via_test |= edge.test_only;
                    hit.path.push(import_path.clone());
                    if hit.via_test {
                        let slot = self.handle(id);
                        let mut node = slot.write();
                        let node_import_path = node.import_path.clone();
                        if let Some(bits) = &mut node.bits
                            && !bits.cyclic_tests
                        {
                            info!("package {:?} needs to be isolated", node_import_path);
                            bits.cyclic_tests = true;
                        }
                        continue;
                    }
                    cycle_errors.push(hit.path);
                }
            }
        }

        if !cycle_errors.is_empty() {
            for cycle in &cycle_errors {
                info!("cycle error: {cycle}");
            }
            return Err(Error::CyclesFound.into());
        }

        let cyclic: Vec<NodeId> = ids
            .into_iter()
            .filter(|id| {
                let slot = self.handle(*id);
                let node = slot.read();
                node.bits.as_ref().is_some_and(|b| b.cyclic_tests)
            })
            .collect();

        for id in cyclic {
            self.isolate(id)?;
        }
        Ok(())
    }

    fn walk_for_cycles(
        &self,
        top: NodeId,
        edge: ImportEdge,
        generation: u64,
    ) -> Result<(), CycleHit> {
        if top == edge.node {
            let slot = self.handle(edge.node);
            return Err(CycleHit {
                path: CyclePath::new(slot.read().import_path.clone()),
                via_test: edge.test_only,
            });
        }

        let import_copy = {
            let slot = self.handle(edge.node);
            let mut node = slot.write();
            if node.visited_generation == generation {
                return Ok(());
            }
            node.visited_generation = generation;
            edges_of(&node)
        };

        for imported in import_copy {
            if let Err(mut hit) = self.walk_for_cycles(top, imported, generation) {
                hit.via_test |= imported.test_only;
                let slot = self.handle(edge.node);
                hit.path.push(slot.read().import_path.clone());
                return Err(hit);
            }
        }
        Ok(())
    }

    /// Split a cyclic package: the `+isolated` clone keeps the tests and is
    /// always linked; the original keeps only production files, is never
    /// linked directly, and caches under a `_compile` name. External-test
    /// dependents are rewired onto the clone.
    fn isolate(&self, id: NodeId) -> Result<()> {
        let mut state = self.state.lock();

        let slot = state.slot(id);
        let import_path = slot.read().import_path.clone();
        let isolated_id = state.obtain(NodeKey::isolated(&import_path), &import_path);
        let isolated_slot = state.slot(isolated_id);

        // Clone the bits wholesale; the derive produces fresh vectors and
        // maps, which is exactly the deep copy the rewiring below relies on.
        let isolated_imports = {
            let node = slot.read();
            let bits = node.bits.as_ref().ok_or_else(|| Error::IncompleteNode {
                import_path: import_path.clone(),
            })?;
            let mut clone = bits.clone();
            clone.cyclic_tests = false;
            clone.link_mode = LinkMode::AlwaysLink;
            let imports = clone.imports.clone();
            let mut isolated = isolated_slot.write();
            isolated.deps.clear();
            isolated.bits = Some(clone);
            imports
        };
        for edge in &isolated_imports {
            state.slot(edge.node).write().deps.push(isolated_id);
        }

        {
            let mut node = slot.write();
            let bits = node.bits.as_mut().expect("checked above");
            bits.link_mode = LinkMode::NeverLink;
            bits.cyclic_tests = false;
            bits.tests = false;
            bits.cache_name = format!("{}_compile", bits.cache_name);
            bits.go_files.retain(|f| !f.test);
        }

        // Drop import edges that exist only because of tests, detaching this
        // node from their dependent lists.
        let removed_imports = {
            let mut node = slot.write();
            let bits = node.bits.as_mut().expect("checked above");
            let mut to_remove: Vec<NodeId> = bits
                .imports
                .iter()
                .filter(|e| e.test_only)
                .map(|e| e.node)
                .collect();
            to_remove.retain(|candidate| {
                !bits
                    .imports
                    .iter()
                    .any(|e| !e.test_only && e.node == *candidate)
            });
            bits.imports.retain(|e| !to_remove.contains(&e.node));
            to_remove
        };
        for removed in removed_imports {
            let removed_slot = state.slot(removed);
            let mut removed_node = removed_slot.write();
            removed_node.deps.retain(|d| *d != id);
            let empty = removed_node.deps.is_empty();
            drop(removed_node);
            if empty {
                state.left_leaf.insert(removed);
            } else {
                state.left_leaf.remove(&removed);
            }
        }

        // Route the external-test dependent through the clone.
        let xtest_path = format!("{import_path}_test");
        let deps: Vec<NodeId> = slot.read().deps.clone();
        let mut kept_deps = Vec::new();
        for dep in deps {
            let dep_slot = state.slot(dep);
            let mut dep_node = dep_slot.write();
            if dep_node.import_path == xtest_path {
                if let Some(bits) = &mut dep_node.bits {
                    for edge in &mut bits.imports {
                        if edge.node == id {
                            edge.node = isolated_id;
                            isolated_slot.write().deps.push(dep);
                        }
                    }
                }
                continue;
            }
            kept_deps.push(dep);
        }
        slot.write().deps = kept_deps;

        state.refresh_leaves(isolated_id);
        state.refresh_leaves(id);
        Ok(())
    }
}

fn edges_of(node: &super::node::Node) -> Vec<ImportEdge> {
    node.bits
        .as_ref()
        .map(|b| b.imports.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{pkg, pkg_with_tests};
    use crate::dag::{Dag, LinkMode, NodeKey};

    #[test]
    fn acyclic_graph_passes_unchanged() {
        let d = Dag::new();
        d.add(&pkg("a", &["b"]), false, false).expect("a");
        d.add(&pkg("b", &[]), false, false).expect("b");
        d.check_for_cycles().expect("no cycles");
        assert!(d.find_by_key(&NodeKey::isolated("a")).is_none());
    }

    #[test]
    fn non_test_cycle_is_fatal() {
        let d = Dag::new();
        d.add(&pkg("a", &["b"]), false, false).expect("a");
        d.add(&pkg("b", &["a"]), false, false).expect("b");
        assert!(d.check_for_cycles().is_err());
    }

    #[test]
    fn test_cycle_is_repaired_by_isolation() {
        // a's tests import b; b imports a.
        let d = Dag::new();
        d.add(&pkg_with_tests("a", &[], &["b"], &[]), true, false)
            .expect("a");
        d.add(&pkg("b", &["a"]), false, false).expect("b");

        d.check_for_cycles().expect("repaired");
        // Second pass verifies nothing survived.
        d.check_for_cycles().expect("still clean");

        // Both nodes sat on the cycle, so both were cloned.
        let a = d.find("a").expect("a");
        let iso_a = d
            .find_by_key(&NodeKey::isolated("a"))
            .expect("a+isolated exists");
        d.find_by_key(&NodeKey::isolated("b"))
            .expect("b+isolated exists");

        let a_slot = d.handle(a);
        let a_node = a_slot.read();
        let a_bits = a_node.bits.as_ref().expect("bits");
        assert_eq!(a_bits.link_mode, LinkMode::NeverLink);
        assert!(!a_bits.tests);
        assert!(a_bits.cache_name.ends_with("_compile"));
        assert!(a_bits.go_files.iter().all(|f| !f.test));
        // The test-only import edge on the base is gone.
        assert!(a_bits.imports.iter().all(|e| !e.test_only));

        let iso_slot = d.handle(iso_a);
        let iso_node = iso_slot.read();
        let iso_bits = iso_node.bits.as_ref().expect("iso bits");
        assert_eq!(iso_bits.link_mode, LinkMode::AlwaysLink);
        assert!(iso_bits.tests);
        assert!(iso_bits.go_files.iter().any(|f| f.test));
    }

    #[test]
    fn xtest_dependent_is_rewired_to_clone() {
        // a's in-package tests import b while b imports a, so a must be
        // isolated; a's external tests then have to consume the clone.
        let d = Dag::new();
        d.add(&pkg_with_tests("a", &[], &["b"], &["a"]), true, false)
            .expect("a");
        d.add(&pkg("b", &["a"]), false, false).expect("b");

        d.check_for_cycles().expect("repaired");

        let iso = d
            .find_by_key(&NodeKey::isolated("a"))
            .expect("isolated clone");
        let ax = d.find("a_test").expect("a_test");
        let a = d.find("a").expect("a");

        let ax_slot = d.handle(ax);
        let ax_node = ax_slot.read();
        let ax_bits = ax_node.bits.as_ref().expect("ax bits");
        assert!(ax_bits.imports.iter().any(|e| e.node == iso));
        assert!(ax_bits.imports.iter().all(|e| e.node != a));

        let iso_slot = d.handle(iso);
        assert!(iso_slot.read().deps.contains(&ax));
    }
}
