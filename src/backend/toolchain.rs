// Copyright 2025 STARGA Inc.
// Licensed under the Apache License, Version 2.0 (the “License”);
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at:
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an “AS IS” BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::process::Command;

use libloading::Library;
use tempfile::TempDir;

use super::scalar_c::{emit_program, ENTRY_SYMBOL};
use super::{Backend, BackendConfig, CompileError, Kernel, COMPILER_ENV};
use crate::ir::Program;

type EntryFn = unsafe extern "C" fn(*mut *mut c_void);

/// Compiles programs to C, builds a shared object with the system C
/// compiler and loads it into the process.
#[derive(Debug, Clone, Default)]
pub struct ScalarCBackend {
    config: BackendConfig,
}

impl ScalarCBackend {
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }

    /// Backend configured by [`BackendConfig::from_env`].
    pub fn from_env() -> Self {
        Self::new(BackendConfig::from_env())
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }
}

impl Backend for ScalarCBackend {
    fn name(&self) -> &'static str {
        "scalar-c"
    }

    #[tracing::instrument(skip_all, fields(functions = program.functions.len()))]
    fn lower(&self, program: &Program) -> Result<Box<dyn Kernel>, CompileError> {
        let source = emit_program(program)?;
        let compiler = resolve_compiler(&self.config)?;

        // A fresh directory per module keeps library paths unique, so every
        // load maps a new object.
        let dir = tempfile::Builder::new()
            .prefix("gradforge-")
            .tempdir()
            .map_err(|source| CompileError::Io {
                path: std::env::temp_dir(),
                source,
            })?;
        let source_path = dir.path().join("kernel.c");
        let library_path = dir
            .path()
            .join(format!("kernel.{}", std::env::consts::DLL_EXTENSION));
        write_file(&source_path, &source)?;
        if let Some(artifacts) = &self.config.artifact_dir {
            save_artifact(artifacts, &source)?;
        }

        let output = Command::new(&compiler)
            .arg(&source_path)
            .arg("-o")
            .arg(&library_path)
            .args(&self.config.flags)
            .args(&self.config.extra_flags)
            .output()
            .map_err(|source| CompileError::Io {
                path: compiler.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(CompileError::Toolchain {
                compiler: compiler.display().to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        tracing::debug!(compiler = %compiler.display(), library = %library_path.display(), "kernel built");

        let library = unsafe { open_library(&library_path) }.map_err(|err| CompileError::Load {
            path: library_path.clone(),
            message: err.to_string(),
        })?;
        let entry: EntryFn = unsafe {
            let symbol = library
                .get::<EntryFn>(ENTRY_SYMBOL.as_bytes())
                .map_err(|err| CompileError::MissingSymbol {
                    symbol: ENTRY_SYMBOL,
                    message: err.to_string(),
                })?;
            *symbol
        };

        Ok(Box::new(NativeKernel {
            entry,
            _library: library,
            _dir: dir,
        }))
    }
}

// Fields drop in order: the library is unloaded before its directory is
// removed.
struct NativeKernel {
    entry: EntryFn,
    _library: Library,
    _dir: TempDir,
}

impl Kernel for NativeKernel {
    unsafe fn run(&self, buffers: &mut [*mut c_void]) {
        (self.entry)(buffers.as_mut_ptr());
    }
}

#[cfg(unix)]
unsafe fn open_library(path: &Path) -> Result<Library, libloading::Error> {
    use libloading::os::unix::{Library as UnixLibrary, RTLD_LOCAL, RTLD_NOW};
    UnixLibrary::open(Some(path), RTLD_NOW | RTLD_LOCAL).map(Library::from)
}

#[cfg(not(unix))]
unsafe fn open_library(path: &Path) -> Result<Library, libloading::Error> {
    Library::new(path)
}

/// Explicit configuration first, then [`COMPILER_ENV`], then `CC`, then
/// `cc` from the `PATH`.
fn resolve_compiler(config: &BackendConfig) -> Result<PathBuf, CompileError> {
    fn locate(candidate: &str) -> Result<PathBuf, CompileError> {
        which::which(candidate).map_err(|_| CompileError::ToolMissing(candidate.to_string()))
    }

    if let Some(path) = &config.compiler {
        return locate(&path.to_string_lossy());
    }
    for env in [COMPILER_ENV, "CC"] {
        if let Ok(value) = std::env::var(env) {
            if !value.trim().is_empty() {
                return locate(value.trim());
            }
        }
    }
    locate("cc")
}

fn write_file(path: &Path, contents: &str) -> Result<(), CompileError> {
    std::fs::write(path, contents).map_err(|source| CompileError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn save_artifact(dir: &Path, source: &str) -> Result<(), CompileError> {
    std::fs::create_dir_all(dir).map_err(|source| CompileError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let file = tempfile::Builder::new()
        .prefix("kernel-")
        .suffix(".c")
        .tempfile_in(dir)
        .map_err(|source| CompileError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    write_file(file.path(), source)?;
    file.keep().map_err(|err| CompileError::Io {
        path: dir.to_path_buf(),
        source: err.error,
    })?;
    Ok(())
}
