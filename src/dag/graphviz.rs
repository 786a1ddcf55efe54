// Purpose: Render a DOT snapshot of the graph around a chosen set of keys.
// Inputs/Outputs: Writes a Graphviz digraph file; the graph itself is untouched.
// Invariants: Only listed keys and their direct neighbors become DOT nodes.
// Gotchas: Edges through unrendered intermediates are drawn from the last rendered ancestor.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use log::warn;

use super::Dag;
use super::node::{NodeId, NodeKey};

impl Dag {
    /// Dump the subgraph induced by `keys` (plus direct imports and
    /// dependents) to `output` in DOT form.
    pub fn graph(&self, output: &Path, keys: &[String]) -> Result<()> {
        let mut rendered: HashMap<NodeId, String> = HashMap::new();

        for key in keys {
            let Some(id) = self.find_by_key(&NodeKey::from(key.as_str())) else {
                match self.closest_key(key) {
                    Some(hint) => warn!("graph key {key:?} not found, did you mean {hint:?}?"),
                    None => warn!("graph key {key:?} not found"),
                }
                continue;
            };
            let slot = self.handle(id);
            let node = slot.read();
            rendered.insert(id, node.key.to_string());
            if let Some(bits) = &node.bits {
                for edge in &bits.imports {
                    let imp_slot = self.handle(edge.node);
                    let imp = imp_slot.read();
                    rendered.entry(edge.node).or_insert(imp.key.to_string());
                }
            }
            for &dep in &node.deps {
                let dep_slot = self.handle(dep);
                let dep_node = dep_slot.read();
                rendered.entry(dep).or_insert(dep_node.key.to_string());
            }
        }

        let mut edges: HashSet<(NodeId, NodeId)> = HashSet::new();
        let roots: Vec<NodeId> = rendered.keys().copied().collect();
        for id in roots {
            let generation = {
                let mut state = self.state.lock();
                state.flag_generation += 1;
                state.flag_generation
            };
            let imports = self.imports_of(id);
            for imported in imports {
                if rendered.contains_key(&imported) {
                    edges.insert((id, imported));
                }
                self.recurse_graph(id, imported, generation, &rendered, &mut edges);
            }
        }

        let mut out = String::new();
        out.push_str("digraph dag {\n");
        let mut names: Vec<&String> = rendered.values().collect();
        names.sort();
        for name in names {
            let _ = writeln!(out, "  \"{name}\";");
        }
        let mut lines: Vec<String> = edges
            .iter()
            .map(|(from, to)| format!("  \"{}\" -> \"{}\";", rendered[from], rendered[to]))
            .collect();
        lines.sort();
        for line in lines {
            out.push_str(&line);
            out.push('\n');
        }
        out.push_str("}\n");

        fs::write(output, out).with_context(|| format!("write {}", output.display()))?;
        Ok(())
    }

    fn recurse_graph(
        &self,
        mut last: NodeId,
        id: NodeId,
        generation: u64,
        rendered: &HashMap<NodeId, String>,
        edges: &mut HashSet<(NodeId, NodeId)>,
    ) {
        {
            let slot = self.handle(id);
            let mut node = slot.write();
            if node.visited_generation == generation {
                return;
            }
            node.visited_generation = generation;
        }
        if rendered.contains_key(&id) {
            last = id;
        }
        for imported in self.imports_of(id) {
            if rendered.contains_key(&imported) {
                edges.insert((last, imported));
            }
            self.recurse_graph(last, imported, generation, rendered, edges);
        }
    }

    fn imports_of(&self, id: NodeId) -> Vec<NodeId> {
        let slot = self.handle(id);
        let node = slot.read();
        node.bits
            .as_ref()
            .map(|b| b.imports.iter().map(|e| e.node).collect())
            .unwrap_or_default()
    }

    fn closest_key(&self, wanted: &str) -> Option<String> {
        let mut best: Option<(String, f64)> = None;
        for key in self.keys() {
            let score = strsim::jaro_winkler(wanted, &key.0);
            if best.as_ref().map(|(_, s)| score > *s).unwrap_or(true) {
                best = Some((key.0, score));
            }
        }
        match best {
            Some((key, score)) if score >= 0.84 => Some(key),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::pkg;
    use crate::dag::Dag;
    use std::fs;

    #[test]
    fn dot_output_contains_listed_nodes_and_edges() {
        let d = Dag::new();
        d.add(&pkg("a", &["b"]), false, false).expect("a");
        d.add(&pkg("b", &["c"]), false, false).expect("b");
        d.add(&pkg("c", &[]), false, false).expect("c");

        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("dag.dot");
        d.graph(&out, &["a".to_string(), "c".to_string()])
            .expect("graph");

        let text = fs::read_to_string(&out).expect("read dot");
        assert!(text.starts_with("digraph dag {"));
        assert!(text.contains("\"a\";"));
        assert!(text.contains("\"c\";"));
        // b is a direct import of a, so it renders; the a->b edge shows up
        // and c is reached through b.
        assert!(text.contains("\"a\" -> \"b\";"));
        assert!(text.contains("\"b\" -> \"c\";"));
    }
}
