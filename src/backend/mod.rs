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

//! Native execution of lowered programs.
//!
//! A [`Backend`] turns a verified [`Program`] into a [`Kernel`]: a single
//! entry point taking the table of buffer pointers. [`ExecutableModule`]
//! owns the kernel together with the scratch buffers of the program and
//! binds the caller's tensors on every execution.

use std::ffi::c_void;
use std::path::PathBuf;

use crate::ir::{verify_program, IrVerifyError, Program};

mod module;
pub mod scalar_c;
#[cfg(feature = "native")]
mod toolchain;

pub use module::{ExecutableModule, ExecuteError};
pub use scalar_c::{emit_program, ENTRY_SYMBOL};
#[cfg(feature = "native")]
pub use toolchain::ScalarCBackend;

/// Environment variable naming the C compiler.
pub const COMPILER_ENV: &str = "GRADFORGE_CC";
/// Environment variable with extra whitespace-separated compiler flags.
pub const CFLAGS_ENV: &str = "GRADFORGE_CFLAGS";

/// Flags passed to the C compiler after the source and output paths.
pub const DEFAULT_FLAGS: &[&str] = &[
    "-O3",
    "-march=native",
    "-mtune=native",
    "-fPIC",
    "-shared",
    "-lm",
];

/// Compiled form of a program.
pub trait Kernel {
    /// Run every function of the program once.
    ///
    /// # Safety
    ///
    /// `buffers` must hold one pointer per program buffer, in buffer order.
    /// Each pointer must address at least as many writable `f64` elements as
    /// the buffer's declared length, and nothing else may access that memory
    /// for the duration of the call.
    unsafe fn run(&self, buffers: &mut [*mut c_void]);
}

/// Compilation target for lowered programs.
pub trait Backend {
    fn name(&self) -> &'static str;

    fn lower(&self, program: &Program) -> Result<Box<dyn Kernel>, CompileError>;
}

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("invalid program: {0}")]
    Verify(#[from] IrVerifyError),
    #[error("failed to format generated source")]
    Emit(#[from] std::fmt::Error),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("C compiler not found: {0}")]
    ToolMissing(String),
    #[error("{compiler} exited with {status}: {stderr}")]
    Toolchain {
        compiler: String,
        status: String,
        stderr: String,
    },
    #[error("failed to load {path}: {message}")]
    Load { path: PathBuf, message: String },
    #[error("symbol {symbol} not found: {message}")]
    MissingSymbol {
        symbol: &'static str,
        message: String,
    },
}

/// Toolchain settings for the scalar C backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    /// Compiler to run. When unset the compiler is taken from
    /// [`COMPILER_ENV`], then `CC`, then `cc` on the `PATH`.
    pub compiler: Option<PathBuf>,
    pub flags: Vec<String>,
    /// Appended after `flags`.
    pub extra_flags: Vec<String>,
    /// Directory that receives a copy of every generated C source file.
    pub artifact_dir: Option<PathBuf>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            compiler: None,
            flags: DEFAULT_FLAGS.iter().map(|flag| flag.to_string()).collect(),
            extra_flags: Vec::new(),
            artifact_dir: None,
        }
    }
}

impl BackendConfig {
    /// Default settings plus any flags from [`CFLAGS_ENV`].
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(flags) = std::env::var(CFLAGS_ENV) {
            config.extra_flags = flags.split_whitespace().map(str::to_string).collect();
        }
        config
    }

    pub fn with_compiler(mut self, compiler: impl Into<PathBuf>) -> Self {
        self.compiler = Some(compiler.into());
        self
    }

    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.extra_flags.push(flag.into());
        self
    }

    pub fn with_artifact_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifact_dir = Some(dir.into());
        self
    }
}

/// Verify `program`, compile it with `backend`, and wrap the result.
pub fn compile(program: Program, backend: &dyn Backend) -> Result<ExecutableModule, CompileError> {
    verify_program(&program)?;
    let kernel = backend.lower(&program)?;
    tracing::debug!(
        backend = backend.name(),
        functions = program.functions.len(),
        buffers = program.buffers.len(),
        "module compiled"
    );
    Ok(ExecutableModule::new(program, kernel))
}
