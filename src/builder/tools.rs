// Purpose: Invoke the Go toolchain binaries behind strongly-typed argument records.
// Inputs/Outputs: Spawns `go tool compile/asm/pack/link/buildid`; captures combined output.
// Invariants: Child processes always run with CGO disabled and the context's GOOS/GOARCH.
// Gotchas: Failure surfaces the tool's output verbatim; callers should not re-wrap it.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::Result;
use log::info;

use crate::buildctx::BuildCtx;
use crate::errors::Error;

#[derive(Clone)]
pub struct Tools {
    pub ctx: BuildCtx,
    /// Log every external command line before running it.
    pub log_commands: bool,
}

#[derive(Debug, Default)]
pub struct CompileArgs {
    pub working_directory: PathBuf,
    pub files: Vec<String>,
    pub trim_path: String,
    pub concurrency: usize,
    pub package_import_path: String,
    pub import_config_file: PathBuf,
    pub compiling_standard_library: bool,
    pub compiling_runtime_library: bool,
    pub complete: bool,
    pub pack: bool,
    pub output_file: PathBuf,
    pub build_id: String,
    pub sym_abis_file: Option<PathBuf>,
    pub asm_header_file: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct AssembleArgs {
    pub working_directory: PathBuf,
    pub files: Vec<String>,
    pub trim_path: String,
    pub package_import_path: String,
    pub include_dirs: Vec<PathBuf>,
    pub defines: Vec<String>,
    pub gen_sym_abis: bool,
    pub output_file: PathBuf,
}

#[derive(Debug, Default)]
pub struct PackArgs {
    pub working_directory: PathBuf,
    pub object_file: PathBuf,
    pub names: Vec<PathBuf>,
}

#[derive(Debug, Default)]
pub struct LinkArgs {
    pub working_directory: PathBuf,
    pub build_mode: String,
    pub external_linker: String,
    pub import_config_file: PathBuf,
    pub output_file: PathBuf,
    pub files: Vec<PathBuf>,
}

impl Tools {
    pub fn new(ctx: BuildCtx, log_commands: bool) -> Self {
        Self { ctx, log_commands }
    }

    pub fn compile(&self, args: &CompileArgs) -> Result<()> {
        let mut argv: Vec<String> = vec![
            "-o".into(),
            args.output_file.display().to_string(),
            "-p".into(),
            args.package_import_path.clone(),
            "-importcfg".into(),
            args.import_config_file.display().to_string(),
            "-buildid".into(),
            args.build_id.clone(),
        ];
        if !args.trim_path.is_empty() {
            argv.push("-trimpath".into());
            argv.push(args.trim_path.clone());
        }
        if args.concurrency > 0 {
            argv.push(format!("-c={}", args.concurrency));
        }
        if args.compiling_standard_library {
            argv.push("-std".into());
        }
        if args.compiling_runtime_library {
            argv.push("-+".into());
        }
        if args.complete {
            argv.push("-complete".into());
        }
        if args.pack {
            argv.push("-pack".into());
        }
        if let Some(symabis) = &args.sym_abis_file {
            argv.push("-symabis".into());
            argv.push(symabis.display().to_string());
        }
        if let Some(asmhdr) = &args.asm_header_file {
            argv.push("-asmhdr".into());
            argv.push(asmhdr.display().to_string());
        }
        argv.extend(args.files.iter().cloned());
        self.run("compile", &args.working_directory, &argv)?;
        Ok(())
    }

    pub fn assemble(&self, args: &AssembleArgs) -> Result<()> {
        let mut argv: Vec<String> = vec![
            "-o".into(),
            args.output_file.display().to_string(),
            "-p".into(),
            args.package_import_path.clone(),
        ];
        if !args.trim_path.is_empty() {
            argv.push("-trimpath".into());
            argv.push(args.trim_path.clone());
        }
        for dir in &args.include_dirs {
            argv.push("-I".into());
            argv.push(dir.display().to_string());
        }
        for def in &args.defines {
            argv.push("-D".into());
            argv.push(def.clone());
        }
        if args.gen_sym_abis {
            argv.push("-gensymabis".into());
        }
        argv.extend(args.files.iter().cloned());
        self.run("asm", &args.working_directory, &argv)?;
        Ok(())
    }

    /// Append objects to an existing archive.
    pub fn pack(&self, args: &PackArgs) -> Result<()> {
        let mut argv: Vec<String> = vec!["r".into(), args.object_file.display().to_string()];
        argv.extend(args.names.iter().map(|n| n.display().to_string()));
        self.run("pack", &args.working_directory, &argv)?;
        Ok(())
    }

    pub fn link(&self, args: &LinkArgs) -> Result<()> {
        let mut argv: Vec<String> = vec![
            "-o".into(),
            args.output_file.display().to_string(),
            "-importcfg".into(),
            args.import_config_file.display().to_string(),
            format!("-buildmode={}", args.build_mode),
            format!("-extld={}", args.external_linker),
        ];
        argv.extend(args.files.iter().map(|f| f.display().to_string()));
        self.run("link", &args.working_directory, &argv)?;
        Ok(())
    }

    /// Read the build ID embedded in an object file.
    pub fn read_build_id(&self, object_file: &Path) -> Result<String> {
        let out = self.run(
            "buildid",
            object_file.parent().unwrap_or(Path::new(".")),
            &[object_file.display().to_string()],
        )?;
        Ok(out.trim().to_string())
    }

    /// Rewrite the object's content-hash half of the build ID.
    pub fn write_build_id(&self, object_file: &Path) -> Result<()> {
        self.run(
            "buildid",
            object_file.parent().unwrap_or(Path::new(".")),
            &["-w".to_string(), object_file.display().to_string()],
        )?;
        Ok(())
    }

    fn run(&self, tool: &str, dir: &Path, args: &[String]) -> Result<String> {
        if self.log_commands {
            info!("go tool {tool} {}", args.join(" "));
        }
        let output = Command::new("go")
            .arg("tool")
            .arg(tool)
            .args(args)
            .current_dir(dir)
            .env("CGO_ENABLED", "0")
            .env("GOOS", &self.ctx.goos)
            .env("GOARCH", &self.ctx.goarch)
            .output()
            .map_err(|e| Error::Tool {
                tool: tool.to_string(),
                stderr: e.to_string(),
            })?;
        let combined = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        if !output.status.success() {
            return Err(Error::Tool {
                tool: tool.to_string(),
                stderr: combined,
            }
            .into());
        }
        Ok(combined)
    }
}
