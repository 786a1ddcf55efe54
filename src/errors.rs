// Purpose: Define the typed failure kinds surfaced by the build pipeline.
// Inputs/Outputs: Constructed by visitors and the driver; rendered to the user on exit.
// Invariants: Tool stderr is carried verbatim; cycle paths list nodes from the closing edge outward.
// Gotchas: These are roots inside anyhow chains; match with downcast_ref, not string parsing.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// A dependency cycle, innermost node first. Rendered outermost-first so the
/// report reads from the offending package down to the edge that closed the
/// loop, matching the order packages were entered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CyclePath {
    pub imports: Vec<String>,
}

impl CyclePath {
    pub fn new(closing: String) -> Self {
        Self {
            imports: vec![closing],
        }
    }

    pub fn push(&mut self, import_path: String) {
        self.imports.push(import_path);
    }
}

impl fmt::Display for CyclePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for import_path in self.imports.iter().rev() {
            writeln!(f, "{import_path}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("only one of --from-stdin, --from-file or positional packages can be used")]
    AmbiguousInput,

    #[error("no packages to build")]
    NoPackages,

    #[error("package list tool failed: {stderr}")]
    ListTool { stderr: String },

    #[error("malformed package record: {0}")]
    MalformedRecord(String),

    #[error("package {import_path:?} already has bits")]
    DuplicateBits { import_path: String },

    #[error("node {key:?} not found")]
    NodeNotFound { key: String },

    #[error("node {import_path:?} is incomplete")]
    IncompleteNode { import_path: String },

    #[error("cycle errors found")]
    CyclesFound,

    #[error("missing build id for {import_path:?}")]
    MissingBuildId { import_path: String },

    #[error("could not resolve a type for {name:?} in {file}")]
    UnresolvableType { name: String, file: String },

    #[error("ambiguous TestMain in {import_path:?}: {first} and {second}")]
    DuplicateTestMain {
        import_path: String,
        first: String,
        second: String,
    },

    #[error("{tool} failed:\n{stderr}")]
    Tool { tool: String, stderr: String },

    #[error("missing artifact for {import_path:?}")]
    MissingArtifact { import_path: String },

    #[error("main has dependents")]
    MainHasDependents,

    #[error("cache io on {path}: {source}")]
    CacheIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::CyclePath;

    #[test]
    fn cycle_path_renders_outermost_first() {
        let mut path = CyclePath::new("a".to_string());
        path.push("b".to_string());
        path.push("c".to_string());
        assert_eq!(path.to_string(), "c\nb\na\n");
    }
}
