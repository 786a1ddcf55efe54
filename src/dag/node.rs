// Purpose: Define the node model stored in the package graph arena.
// Inputs/Outputs: Plain data mutated by visitors under each slot's lock.
// Invariants: `deps` mirrors import edges; meta fields are owned by one visitor each.
// Gotchas: `bits` is None for placeholder nodes until the importer fills them.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;

use crate::dag::Dag;
use crate::errors::Error;

/// Arena handle for a node slot. Edges are stored as these, never as
/// pointers, so cloning a node during cycle repair is a plain re-wiring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) usize);

/// Table key. Usually the import path; cloned cyclic variants append
/// `+isolated` and external test packages append `_test`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey(pub String);

impl NodeKey {
    pub fn isolated(import_path: &str) -> Self {
        NodeKey(format!("{import_path}+isolated"))
    }
}

impl From<&str> for NodeKey {
    fn from(s: &str) -> Self {
        NodeKey(s.to_string())
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkMode {
    #[default]
    LinkIfNeeded,
    AlwaysLink,
    NeverLink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportEdge {
    pub node: NodeId,
    /// Present only because of test sources. Test-only edges are excluded
    /// from build IDs and tolerated by cycle detection.
    pub test_only: bool,
}

/// Fills in a synthetic source file at build time, once upstream artifacts
/// exist. Used by the generated test driver's `main.go`.
pub trait SourceGenerator: Send + Sync {
    fn generate(&self, dag: &Dag, node: &Node, out: &mut dyn Write) -> Result<()>;
}

#[derive(Clone)]
pub struct GoFile {
    pub dir: PathBuf,
    pub filename: String,
    pub test: bool,
    pub generator: Option<Arc<dyn SourceGenerator>>,
}

impl GoFile {
    pub fn plain(dir: PathBuf, filename: String, test: bool) -> Self {
        Self {
            dir,
            filename,
            test,
            generator: None,
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.filename)
    }
}

impl fmt::Debug for GoFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GoFile")
            .field("dir", &self.dir)
            .field("filename", &self.filename)
            .field("test", &self.test)
            .field("generator", &self.generator.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SFile {
    pub dir: PathBuf,
    pub filename: String,
}

impl SFile {
    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.filename)
    }
}

/// Everything known about a package once its metadata has been ingested.
#[derive(Debug, Clone, Default)]
pub struct NodeBits {
    pub name: String,
    /// Filename stem inside the package cache directory. Diverges from
    /// `name` when cycle repair renames the compile-only variant.
    pub cache_name: String,
    pub tests: bool,
    pub source_dir: PathBuf,
    pub root_dir: PathBuf,
    pub goroot: bool,
    pub standard: bool,
    pub intrinsic: bool,
    pub cyclic_tests: bool,
    pub link_mode: LinkMode,
    pub go_files: Vec<GoFile>,
    pub s_files: Vec<SFile>,
    pub imports: Vec<ImportEdge>,
    pub import_map: BTreeMap<String, String>,
    /// Compiled archive, set by the cache puller or the builder.
    pub artifact: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashMeta {
    pub build_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildMeta {
    pub rebuilt: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RewriteMeta {
    /// Files were rewritten; the node's build ID must be recomputed.
    pub changed: bool,
    pub out_dir: PathBuf,
    pub generated_files: Vec<String>,
}

#[derive(Debug)]
pub struct Node {
    pub id: NodeId,
    pub key: NodeKey,
    pub import_path: String,
    /// Dependents: nodes holding an import edge to this one.
    pub deps: Vec<NodeId>,
    pub bits: Option<NodeBits>,
    pub hash_meta: Option<HashMeta>,
    pub build_meta: Option<BuildMeta>,
    pub rewrite_meta: Option<RewriteMeta>,
    /// Cycle-walk visited flag, valid for one detection generation.
    pub(crate) visited_generation: u64,
}

impl Node {
    pub(crate) fn placeholder(id: NodeId, key: NodeKey, import_path: String) -> Self {
        Self {
            id,
            key,
            import_path,
            deps: Vec::new(),
            bits: None,
            hash_meta: None,
            build_meta: None,
            rewrite_meta: None,
            visited_generation: 0,
        }
    }

    pub fn bits(&self) -> Result<&NodeBits> {
        self.bits.as_ref().ok_or_else(|| {
            Error::IncompleteNode {
                import_path: self.import_path.clone(),
            }
            .into()
        })
    }

    pub fn bits_mut(&mut self) -> Result<&mut NodeBits> {
        let import_path = self.import_path.clone();
        self.bits
            .as_mut()
            .ok_or_else(|| Error::IncompleteNode { import_path }.into())
    }

    pub fn build_id(&self) -> Result<&str> {
        match &self.hash_meta {
            Some(meta) => Ok(&meta.build_id),
            None => Err(Error::MissingBuildId {
                import_path: self.import_path.clone(),
            }
            .into()),
        }
    }

    pub fn is_intrinsic(&self) -> bool {
        self.bits.as_ref().is_some_and(|b| b.intrinsic)
    }

    pub fn has_tests(&self) -> bool {
        self.bits.as_ref().is_some_and(|b| b.tests)
    }

    pub fn artifact(&self) -> Option<&PathBuf> {
        self.bits.as_ref().and_then(|b| b.artifact.as_ref())
    }
}
