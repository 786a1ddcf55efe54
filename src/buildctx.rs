// Purpose: Capture the Go toolchain context every stage hashes and builds against.
// Inputs/Outputs: Probes `go env`/`go version` once; read-only afterwards.
// Invariants: CGO is always off; GOOS/GOARCH honor environment overrides.
// Gotchas: Release tags are derived from GOVERSION, matching go/build defaults.

use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result, bail};

pub const COMPILER: &str = "gc";

#[derive(Debug, Clone)]
pub struct BuildCtx {
    pub goos: String,
    pub goarch: String,
    pub goroot: PathBuf,
    pub gopath: String,
    pub compiler: String,
    pub install_suffix: String,
    pub release_tags: Vec<String>,
    pub build_tags: Vec<String>,
    pub cgo_enabled: bool,
    /// `go version` output line, part of hash provenance.
    pub toolchain_version: String,
    /// This tool's own version, also part of hash provenance.
    pub own_version: String,
}

impl BuildCtx {
    pub fn probe() -> Result<Self> {
        let vars = go_env(&["GOOS", "GOARCH", "GOROOT", "GOPATH", "GOVERSION"])?;
        let [def_goos, def_goarch, goroot, gopath, goversion] = vars.as_slice() else {
            bail!("unexpected go env output");
        };

        let goos = env_or("GOOS", def_goos);
        let goarch = env_or("GOARCH", def_goarch);
        if goroot.is_empty() {
            bail!("go env reported an empty GOROOT");
        }

        let toolchain_version = go_version()?;

        Ok(Self {
            goos,
            goarch,
            goroot: PathBuf::from(goroot),
            gopath: gopath.clone(),
            compiler: COMPILER.to_string(),
            install_suffix: String::new(),
            release_tags: release_tags_for(goversion),
            build_tags: Vec::new(),
            cgo_enabled: false,
            toolchain_version,
            own_version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    /// Platform component of the cache layout, e.g. `linux_amd64`.
    pub fn target(&self) -> String {
        format!("{}_{}", self.goos, self.goarch)
    }

    pub fn goroot_pkg_include(&self) -> PathBuf {
        self.goroot.join("pkg").join("include")
    }
}

fn env_or(name: &str, default: &str) -> String {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

fn go_env(names: &[&str]) -> Result<Vec<String>> {
    let output = Command::new("go")
        .arg("env")
        .args(names)
        .env("CGO_ENABLED", "0")
        .output()
        .context("running go env")?;
    if !output.status.success() {
        bail!(
            "go env failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let values: Vec<String> = stdout.lines().map(|l| l.trim().to_string()).collect();
    if values.len() != names.len() {
        bail!("go env returned {} values, wanted {}", values.len(), names.len());
    }
    Ok(values)
}

fn go_version() -> Result<String> {
    let output = Command::new("go")
        .arg("version")
        .output()
        .context("running go version")?;
    if !output.status.success() {
        bail!("go version failed");
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Expand a GOVERSION like `go1.21.3` into the cumulative release tag list
/// `go1.1` through `go1.21`, the same set go/build advertises.
fn release_tags_for(goversion: &str) -> Vec<String> {
    let minor = goversion
        .strip_prefix("go1.")
        .and_then(|rest| rest.split(['.', 'r', 'b']).next())
        .and_then(|minor| minor.parse::<u32>().ok());
    let Some(minor) = minor else {
        return Vec::new();
    };
    (1..=minor).map(|m| format!("go1.{m}")).collect()
}
