// Purpose: Maintain the package DAG: node table, edges and leaf indexes.
// Inputs/Outputs: Ingests Package records; hands visitors exclusive node borrows.
// Invariants: deps mirror import edges; left leaf iff no dependents, right leaf iff no imports.
// Gotchas: The outer mutex orders table/index mutation; long work must happen under slot locks only.

pub mod cycles;
pub mod graphviz;
pub mod node;
pub mod visit;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use log::info;
use parking_lot::{Mutex, RwLock};

use crate::errors::Error;
use crate::pkg::Package;

pub use node::{
    BuildMeta, GoFile, HashMeta, ImportEdge, LinkMode, Node, NodeBits, NodeId, NodeKey,
    RewriteMeta, SFile, SourceGenerator,
};
pub use visit::{CancelToken, VisitCx, Visitor};

pub struct Dag {
    state: Mutex<DagState>,
}

#[derive(Default)]
struct DagState {
    slots: Vec<Arc<RwLock<Node>>>,
    table: HashMap<NodeKey, NodeId>,
    /// Nodes without dependents.
    left_leaf: HashSet<NodeId>,
    /// Nodes without imports.
    right_leaf: HashSet<NodeId>,
    flag_generation: u64,
}

impl DagState {
    fn obtain(&mut self, key: NodeKey, import_path: &str) -> NodeId {
        if let Some(id) = self.table.get(&key) {
            return *id;
        }
        let id = NodeId(self.slots.len());
        self.slots.push(Arc::new(RwLock::new(Node::placeholder(
            id,
            key.clone(),
            import_path.to_string(),
        ))));
        self.table.insert(key, id);
        // A fresh placeholder has no edges in either direction.
        self.left_leaf.insert(id);
        self.right_leaf.insert(id);
        id
    }

    fn slot(&self, id: NodeId) -> Arc<RwLock<Node>> {
        Arc::clone(&self.slots[id.0])
    }

    /// Recompute both leaf-index memberships for one node.
    fn refresh_leaves(&mut self, id: NodeId) {
        let slot = self.slot(id);
        let node = slot.read();
        let no_imports = node
            .bits
            .as_ref()
            .map(|b| b.imports.is_empty())
            .unwrap_or(true);
        if no_imports {
            self.right_leaf.insert(id);
        } else {
            self.right_leaf.remove(&id);
        }
        if node.deps.is_empty() {
            self.left_leaf.insert(id);
        } else {
            self.left_leaf.remove(&id);
        }
    }
}

impl Default for Dag {
    fn default() -> Self {
        Self::new()
    }
}

impl Dag {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DagState::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slot handle for a node. Lock it to read or mutate.
    pub fn handle(&self, id: NodeId) -> Arc<RwLock<Node>> {
        self.state.lock().slot(id)
    }

    /// Find or create a node for an import path.
    pub fn obtain(&self, import_path: &str) -> NodeId {
        self.state
            .lock()
            .obtain(NodeKey::from(import_path), import_path)
    }

    pub fn obtain_by_key(&self, key: NodeKey, import_path: &str) -> NodeId {
        self.state.lock().obtain(key, import_path)
    }

    pub fn find(&self, import_path: &str) -> Option<NodeId> {
        self.find_by_key(&NodeKey::from(import_path))
    }

    pub fn find_by_key(&self, key: &NodeKey) -> Option<NodeId> {
        self.state.lock().table.get(key).copied()
    }

    /// Node ids currently in the table, in insertion order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let state = self.state.lock();
        let mut ids: Vec<NodeId> = state.table.values().copied().collect();
        ids.sort_by_key(|id| id.0);
        ids
    }

    pub fn keys(&self) -> Vec<NodeKey> {
        let state = self.state.lock();
        let mut keys: Vec<NodeKey> = state.table.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Ingest a package record, wiring import edges and maintaining both leaf
    /// indexes. Placeholder nodes are created for unseen imports. With
    /// `use_isolated`, lookups prefer a pre-existing `+isolated` variant so
    /// consumers of repaired cyclic packages bind to the clone.
    pub fn add(&self, pkg: &Package, include_tests: bool, use_isolated: bool) -> Result<NodeId> {
        let mut state = self.state.lock();

        let node_id = state.obtain(NodeKey::from(pkg.import_path.as_str()), &pkg.import_path);
        if state.slot(node_id).read().bits.is_some() {
            return Err(Error::DuplicateBits {
                import_path: pkg.import_path.clone(),
            }
            .into());
        }

        let mut bits = NodeBits {
            name: pkg.name.clone(),
            cache_name: pkg.name.clone(),
            source_dir: pkg.dir.clone(),
            root_dir: pkg.root.clone(),
            goroot: pkg.goroot,
            standard: pkg.standard,
            intrinsic: matches!(pkg.import_path.as_str(), "C" | "unsafe"),
            import_map: pkg.import_map.clone(),
            ..NodeBits::default()
        };

        for f in &pkg.go_files {
            bits.go_files
                .push(GoFile::plain(pkg.dir.clone(), f.clone(), false));
        }
        if include_tests {
            for f in &pkg.test_go_files {
                bits.go_files
                    .push(GoFile::plain(pkg.dir.clone(), f.clone(), true));
                bits.tests = true;
            }
        }
        for f in &pkg.s_files {
            bits.s_files.push(SFile {
                dir: pkg.dir.clone(),
                filename: f.clone(),
            });
        }

        let mut already_imported = HashSet::new();
        if include_tests && bits.tests {
            for imported in &pkg.test_imports {
                if !already_imported.insert(imported.clone()) {
                    continue;
                }
                let imported_id = find_or_obtain(&mut state, imported, use_isolated);
                state.slot(imported_id).write().deps.push(node_id);
                state.left_leaf.remove(&imported_id);
                bits.imports.push(ImportEdge {
                    node: imported_id,
                    test_only: true,
                });
            }
        }
        for imported in &pkg.imports {
            if !already_imported.insert(imported.clone()) {
                continue;
            }
            let imported_id = find_or_obtain(&mut state, imported, use_isolated);
            state.slot(imported_id).write().deps.push(node_id);
            state.left_leaf.remove(&imported_id);
            bits.imports.push(ImportEdge {
                node: imported_id,
                test_only: false,
            });
        }

        state.slot(node_id).write().bits = Some(bits);

        if include_tests && !pkg.x_test_go_files.is_empty() {
            let import_path_x = format!("{}_test", pkg.import_path);
            let node_x = find_or_obtain(&mut state, &import_path_x, use_isolated);
            if state.slot(node_x).read().bits.is_some() {
                return Err(Error::DuplicateBits {
                    import_path: import_path_x,
                }
                .into());
            }

            let mut bits_x = NodeBits {
                name: format!("{}_test", pkg.name),
                cache_name: format!("{}_test", pkg.name),
                source_dir: pkg.dir.clone(),
                root_dir: pkg.root.clone(),
                goroot: pkg.goroot,
                standard: pkg.standard,
                tests: true,
                // The external test package keeps the base's vendoring map.
                import_map: pkg.import_map.clone(),
                ..NodeBits::default()
            };
            for f in &pkg.x_test_go_files {
                bits_x
                    .go_files
                    .push(GoFile::plain(pkg.dir.clone(), f.clone(), true));
            }

            let mut already_imported_x = HashSet::new();
            for imported in &pkg.x_test_imports {
                if !already_imported_x.insert(imported.clone()) {
                    continue;
                }
                let imported_id = if imported == &pkg.import_path {
                    node_id
                } else {
                    find_or_obtain(&mut state, imported, use_isolated)
                };
                state.slot(imported_id).write().deps.push(node_x);
                state.left_leaf.remove(&imported_id);
                bits_x.imports.push(ImportEdge {
                    node: imported_id,
                    test_only: true,
                });
            }

            state.slot(node_x).write().bits = Some(bits_x);
            state.refresh_leaves(node_x);
        }

        state.refresh_leaves(node_id);
        Ok(node_id)
    }

    /// Wire one extra import edge after construction, used when the rewriter
    /// discovers test-only dependencies. Both leaf indexes are refreshed.
    pub fn add_import_edge(&self, from: NodeId, to: NodeId, test_only: bool) -> Result<()> {
        let mut state = self.state.lock();
        {
            let from_slot = state.slot(from);
            let mut from_node = from_slot.write();
            let bits = from_node.bits_mut()?;
            if bits.imports.iter().any(|e| e.node == to) {
                return Ok(());
            }
            bits.imports.push(ImportEdge {
                node: to,
                test_only,
            });
        }
        state.slot(to).write().deps.push(from);
        state.refresh_leaves(from);
        state.refresh_leaves(to);
        Ok(())
    }

    /// Detach a node from its imports' dependent lists and drop it from the
    /// leaf indexes; the table entry goes away once nothing depends on it.
    pub fn remove(&self, import_path: &str) -> Result<()> {
        let mut state = self.state.lock();
        let key = NodeKey::from(import_path);
        let Some(&id) = state.table.get(&key) else {
            return Err(Error::NodeNotFound {
                key: import_path.to_string(),
            }
            .into());
        };

        let slot = state.slot(id);
        let mut node = slot.write();
        if let Some(bits) = node.bits.take() {
            for edge in &bits.imports {
                let imported = state.slot(edge.node);
                let mut imported = imported.write();
                if let Some(pos) = imported.deps.iter().position(|d| *d == id) {
                    imported.deps.swap_remove(pos);
                }
            }
        }
        let orphan = node.deps.is_empty();
        drop(node);

        state.right_leaf.remove(&id);
        if orphan {
            state.left_leaf.remove(&id);
            state.table.remove(&key);
        }
        Ok(())
    }

    /// Verify every node has bits and both leaf indexes are truthful. With
    /// `full`, additionally count nodes reachable from each side.
    pub fn check_complete(&self, full: bool) -> Result<()> {
        {
            let state = self.state.lock();

            info!("checking all nodes are loaded");
            for &id in state.table.values() {
                let slot = state.slot(id);
                let node = slot.read();
                if node.bits.is_none() {
                    return Err(Error::IncompleteNode {
                        import_path: node.import_path.clone(),
                    }
                    .into());
                }
            }

            info!("checking left");
            for &id in &state.left_leaf {
                let slot = state.slot(id);
                let node = slot.read();
                if !node.deps.is_empty() {
                    anyhow::bail!(
                        "node {:?} is marked as a left leaf but has dependents",
                        node.import_path
                    );
                }
            }

            info!("checking right");
            for &id in &state.right_leaf {
                let slot = state.slot(id);
                let node = slot.read();
                if let Some(bits) = &node.bits
                    && !bits.imports.is_empty()
                {
                    anyhow::bail!(
                        "node {:?} is marked as a right leaf but has imports",
                        node.import_path
                    );
                }
            }
        }

        if full {
            use std::sync::atomic::{AtomicUsize, Ordering};

            let total = self.len();
            let cancel = CancelToken::new();

            info!("checking all nodes are reachable from right");
            let count_right = AtomicUsize::new(0);
            self.visit_all_from_right(&cancel, &|_: &VisitCx, _: &mut Node| -> Result<()> {
                count_right.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })?;
            if count_right.into_inner() != total {
                anyhow::bail!("unable to visit all nodes from right");
            }

            info!("checking all nodes are reachable from left");
            let count_left = AtomicUsize::new(0);
            self.visit_all_from_left(&cancel, &|_: &VisitCx, _: &mut Node| -> Result<()> {
                count_left.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })?;
            if count_left.into_inner() != total {
                anyhow::bail!("unable to visit all nodes from left");
            }
        }

        Ok(())
    }
}

/// Lookup used when adding packages: with `use_isolated`, a pre-existing
/// `+isolated` clone shadows the base path.
fn find_or_obtain(state: &mut DagState, import_path: &str, use_isolated: bool) -> NodeId {
    if use_isolated
        && let Some(&id) = state.table.get(&NodeKey::isolated(import_path))
    {
        return id;
    }
    state.obtain(NodeKey::from(import_path), import_path)
}

#[cfg(test)]
pub(crate) mod testutil {
    use crate::pkg::Package;

    pub fn pkg(import_path: &str, imports: &[&str]) -> Package {
        let name = import_path.rsplit('/').next().unwrap_or(import_path);
        Package {
            import_path: import_path.to_string(),
            name: name.to_string(),
            dir: format!("/src/{import_path}").into(),
            root: "/src".into(),
            go_files: vec![format!("{name}.go")],
            imports: imports.iter().map(|s| s.to_string()).collect(),
            ..Package::default()
        }
    }

    pub fn pkg_with_tests(
        import_path: &str,
        imports: &[&str],
        test_imports: &[&str],
        x_test_imports: &[&str],
    ) -> Package {
        let mut p = pkg(import_path, imports);
        let name = p.name.clone();
        p.test_go_files = vec![format!("{name}_test.go")];
        p.test_imports = test_imports.iter().map(|s| s.to_string()).collect();
        if !x_test_imports.is_empty() {
            p.x_test_go_files = vec![format!("{name}_x_test.go")];
            p.x_test_imports = x_test_imports.iter().map(|s| s.to_string()).collect();
        }
        p
    }
}
