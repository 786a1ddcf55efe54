// Purpose: Import package metadata from the external `go list` tool.
// Inputs/Outputs: Spawns `go list -e -json`; yields normalized Package records.
// Invariants: The returned set is closed over imports, test imports and x-test imports.
// Gotchas: Import lists are rewritten back from their vendored form so later lookups are stable.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result};
use log::debug;
use serde::Deserialize;

use crate::buildctx::BuildCtx;
use crate::errors::Error;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Package {
    #[serde(rename = "ImportPath")]
    pub import_path: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Dir")]
    pub dir: PathBuf,
    #[serde(rename = "Root")]
    pub root: PathBuf,
    #[serde(rename = "Goroot")]
    pub goroot: bool,
    #[serde(rename = "Standard")]
    pub standard: bool,
    #[serde(rename = "GoFiles")]
    pub go_files: Vec<String>,
    #[serde(rename = "TestGoFiles")]
    pub test_go_files: Vec<String>,
    #[serde(rename = "XTestGoFiles")]
    pub x_test_go_files: Vec<String>,
    #[serde(rename = "SFiles")]
    pub s_files: Vec<String>,
    #[serde(rename = "Imports")]
    pub imports: Vec<String>,
    #[serde(rename = "TestImports")]
    pub test_imports: Vec<String>,
    #[serde(rename = "XTestImports")]
    pub x_test_imports: Vec<String>,
    #[serde(rename = "ImportMap")]
    pub import_map: BTreeMap<String, String>,
}

/// Import the target packages with test metadata, then iteratively close the
/// set over any imports the first pass did not cover.
pub fn import_all(ctx: &BuildCtx, dir: &PathBuf, targets: &[String]) -> Result<Vec<Package>> {
    let mut pkgs = list_packages(ctx, dir, targets, false)?;
    let mut known: HashSet<String> = pkgs.iter().map(|p| p.import_path.clone()).collect();

    loop {
        let missing = missing_imports(&pkgs, &known);
        if missing.is_empty() {
            break;
        }
        debug!("import closure: {} packages missing", missing.len());
        let query: Vec<String> = missing.into_iter().collect();
        let fresh = list_packages(ctx, dir, &query, true)?;
        let mut grew = false;
        for pkg in fresh {
            if known.insert(pkg.import_path.clone()) {
                pkgs.push(pkg);
                grew = true;
            }
        }
        if !grew {
            // `go list -e` answered but produced nothing new; the remaining
            // names are intrinsics or unresolvable and the DAG will say so.
            break;
        }
    }

    Ok(pkgs)
}

fn list_packages(
    ctx: &BuildCtx,
    dir: &PathBuf,
    packages: &[String],
    deps: bool,
) -> Result<Vec<Package>> {
    if packages.is_empty() {
        return Ok(Vec::new());
    }

    let mut cmd = Command::new("go");
    cmd.arg("list").arg("-e").arg("-json");
    if deps {
        cmd.arg("-deps");
    }
    cmd.arg("-compiler").arg(&ctx.compiler);
    cmd.arg("--").args(packages);
    cmd.current_dir(dir);
    cmd.env("CGO_ENABLED", "0");
    cmd.env("GOOS", &ctx.goos);
    cmd.env("GOARCH", &ctx.goarch);

    let output = cmd.output().context("running go list")?;
    if !output.status.success() {
        return Err(Error::ListTool {
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
        .into());
    }

    decode_packages(&output.stdout)
}

/// Decode a stream of concatenated JSON package objects.
pub fn decode_packages(stdout: &[u8]) -> Result<Vec<Package>> {
    let mut pkgs = Vec::new();
    let stream = serde_json::Deserializer::from_slice(stdout).into_iter::<Package>();
    for record in stream {
        let mut pkg = record.map_err(|e| Error::MalformedRecord(e.to_string()))?;
        normalize(&mut pkg);
        pkgs.push(pkg);
    }
    Ok(pkgs)
}

/// Rewrite import lists back from their mapped (vendored) names to the
/// original spelling, and strip test-binary suffixes from the import path.
fn normalize(pkg: &mut Package) {
    if let Some(idx) = pkg.import_path.find(' ') {
        pkg.import_path.truncate(idx);
    }
    if pkg.import_map.is_empty() {
        return;
    }
    let inverted: BTreeMap<&str, &str> = pkg
        .import_map
        .iter()
        .map(|(orig, mapped)| (mapped.as_str(), orig.as_str()))
        .collect();
    for list in [
        &mut pkg.imports,
        &mut pkg.test_imports,
        &mut pkg.x_test_imports,
    ] {
        for entry in list.iter_mut() {
            if let Some(orig) = inverted.get(entry.as_str()) {
                *entry = orig.to_string();
            }
        }
    }
}

/// Imports referenced anywhere in `pkgs` whose packages are not yet known.
fn missing_imports(pkgs: &[Package], known: &HashSet<String>) -> BTreeSet<String> {
    let mut missing = BTreeSet::new();
    for pkg in pkgs {
        for list in [&pkg.imports, &pkg.test_imports, &pkg.x_test_imports] {
            for import_path in list.iter() {
                if !known.contains(import_path) {
                    missing.insert(import_path.clone());
                }
            }
        }
    }
    missing
}

#[cfg(test)]
mod tests {
    use super::{Package, decode_packages, missing_imports, normalize};
    use std::collections::HashSet;

    #[test]
    fn decodes_concatenated_records() {
        let stream = br#"
        {"ImportPath": "a", "Name": "a", "GoFiles": ["a.go"], "Imports": ["b"]}
        {"ImportPath": "b", "Name": "b", "GoFiles": ["b.go"]}
        "#;
        let pkgs = decode_packages(stream).expect("decode");
        assert_eq!(pkgs.len(), 2);
        assert_eq!(pkgs[0].import_path, "a");
        assert_eq!(pkgs[1].go_files, vec!["b.go"]);
    }

    #[test]
    fn normalize_rewrites_vendored_imports() {
        let mut pkg = Package {
            import_path: "example.com/app".to_string(),
            imports: vec!["example.com/app/vendor/dep".to_string()],
            test_imports: vec!["example.com/app/vendor/dep".to_string()],
            ..Package::default()
        };
        pkg.import_map
            .insert("dep".to_string(), "example.com/app/vendor/dep".to_string());
        normalize(&mut pkg);
        assert_eq!(pkg.imports, vec!["dep"]);
        assert_eq!(pkg.test_imports, vec!["dep"]);
    }

    #[test]
    fn normalize_strips_test_binary_suffix() {
        let mut pkg = Package {
            import_path: "example.com/app [example.com/app.test]".to_string(),
            ..Package::default()
        };
        normalize(&mut pkg);
        assert_eq!(pkg.import_path, "example.com/app");
    }

    #[test]
    fn missing_set_covers_all_import_lists() {
        let pkg = Package {
            import_path: "a".to_string(),
            imports: vec!["b".to_string()],
            test_imports: vec!["c".to_string()],
            x_test_imports: vec!["d".to_string(), "a".to_string()],
            ..Package::default()
        };
        let known: HashSet<String> = ["a".to_string(), "b".to_string()].into();
        let missing = missing_imports(&[pkg], &known);
        assert_eq!(
            missing.into_iter().collect::<Vec<_>>(),
            vec!["c".to_string(), "d".to_string()]
        );
    }
}
