//! The shader compilation boundary.
//!
//! Front-end parsing is not done here. A [`ShaderCompiler`] hands GLSL
//! source to an external compiler, reflects the resulting SPIR-V and
//! returns bytecode plus a [`ParameterManifest`]. Failures never surface
//! as `Err`: they produce a [`CompileOutput`] with no bytecode and a
//! non-empty log.

use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::introspect::build_manifest;
use crate::manifest::ParameterManifest;

const SPIRV_MAGIC: u32 = 0x0723_0203;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
    Geometry,
    TessControl,
    TessEvaluation,
}

impl ShaderStage {
    /// File extension glslang uses to infer the stage.
    pub fn file_extension(self) -> &'static str {
        match self {
            ShaderStage::Vertex => "vert",
            ShaderStage::Fragment => "frag",
            ShaderStage::Compute => "comp",
            ShaderStage::Geometry => "geom",
            ShaderStage::TessControl => "tesc",
            ShaderStage::TessEvaluation => "tese",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompileOutput {
    /// SPIR-V words, or `None` when compilation or reflection failed.
    pub bytecode: Option<Vec<u32>>,
    pub manifest: ParameterManifest,
    pub log: String,
}

impl CompileOutput {
    fn failed(log: String) -> Self {
        Self {
            bytecode: None,
            manifest: ParameterManifest::default(),
            log,
        }
    }

    pub fn is_success(&self) -> bool {
        self.bytecode.is_some()
    }
}

pub trait ShaderCompiler {
    fn compile(&self, source: &str, stage: ShaderStage) -> CompileOutput;
}

/// Reflect already-compiled SPIR-V into a [`CompileOutput`].
///
/// Shared by every compiler front end once it has bytecode.
pub fn reflect_bytecode(words: Vec<u32>, stage: ShaderStage, log: String) -> CompileOutput {
    let manifest = crate::spirv::introspect(&words, stage)
        .and_then(|program| build_manifest(&program));
    match manifest {
        Ok(manifest) => CompileOutput {
            bytecode: Some(words),
            manifest,
            log,
        },
        Err(message) => {
            tracing::error!("Shader reflection failed: {message}");
            CompileOutput::failed(format!("Link error: {message}\n{log}"))
        }
    }
}

/// Decode a little-endian SPIR-V byte stream into words.
pub fn spirv_words(bytes: &[u8]) -> Result<Vec<u32>, String> {
    if bytes.len() % 4 != 0 {
        return Err(format!(
            "SPIR-V length {} is not a multiple of 4",
            bytes.len()
        ));
    }
    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    if words.first() != Some(&SPIRV_MAGIC) {
        return Err("missing SPIR-V magic number".to_owned());
    }
    Ok(words)
}

/// Compiles GLSL by invoking `glslangValidator`.
#[derive(Debug, Clone)]
pub struct GlslangCompiler {
    pub executable: PathBuf,
    pub target_env: String,
}

impl Default for GlslangCompiler {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("glslangValidator"),
            target_env: "vulkan1.2".to_owned(),
        }
    }
}

static SCRATCH_COUNTER: AtomicU64 = AtomicU64::new(0);

impl GlslangCompiler {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            ..Self::default()
        }
    }

    /// Whether the executable can be launched at all.
    pub fn is_available(&self) -> bool {
        Command::new(&self.executable)
            .arg("--version")
            .output()
            .is_ok_and(|out| out.status.success())
    }

    fn scratch_paths(&self, stage: ShaderStage) -> (PathBuf, PathBuf) {
        let n = SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed);
        let stem = format!("vkcore-{}-{n}", std::process::id());
        let dir = std::env::temp_dir();
        (
            dir.join(format!("{stem}.{}", stage.file_extension())),
            dir.join(format!("{stem}.spv")),
        )
    }

    fn run(&self, source: &str, stage: ShaderStage) -> Result<(Vec<u8>, String), String> {
        let (src_path, out_path) = self.scratch_paths(stage);
        std::fs::write(&src_path, source)
            .map_err(|e| format!("Compile error: cannot write {}: {e}", src_path.display()))?;

        let output = Command::new(&self.executable)
            .arg("-V")
            .arg("--target-env")
            .arg(&self.target_env)
            .arg("-o")
            .arg(&out_path)
            .arg(&src_path)
            .output();
        let _ = std::fs::remove_file(&src_path);

        let output = output.map_err(|e| {
            format!(
                "Compile error: failed to launch {:?}: {e}",
                self.executable
            )
        })?;
        let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
        log.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            let _ = std::fs::remove_file(&out_path);
            return Err(format!("Compile error: {log}"));
        }

        let bytes = std::fs::read(&out_path)
            .map_err(|e| format!("Compile error: cannot read {}: {e}", out_path.display()))?;
        let _ = std::fs::remove_file(&out_path);
        Ok((bytes, log))
    }
}

impl ShaderCompiler for GlslangCompiler {
    fn compile(&self, source: &str, stage: ShaderStage) -> CompileOutput {
        let _span = tracing::debug_span!("glslang_compile", ?stage).entered();
        let (bytes, log) = match self.run(source, stage) {
            Ok(result) => result,
            Err(log) => {
                tracing::warn!("Shader compilation failed");
                return CompileOutput::failed(log);
            }
        };
        match spirv_words(&bytes) {
            Ok(words) => reflect_bytecode(words, stage, log),
            Err(e) => CompileOutput::failed(format!("Compile error: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spirv_words_checks_length_and_magic() {
        assert!(spirv_words(&[1, 2, 3]).is_err());
        assert!(spirv_words(&[0, 0, 0, 0]).is_err());
        let words = spirv_words(&[0x03, 0x02, 0x23, 0x07, 0, 0, 1, 0]).unwrap();
        assert_eq!(words, [SPIRV_MAGIC, 0x0001_0000]);
    }

    #[test]
    fn missing_compiler_yields_log_not_panic() {
        let compiler = GlslangCompiler::new("/nonexistent/glslangValidator");
        assert!(!compiler.is_available());
        let out = compiler.compile("#version 450\nvoid main() {}\n", ShaderStage::Compute);
        assert!(!out.is_success());
        assert!(out.log.starts_with("Compile error: "));
        assert!(out.manifest.is_empty());
    }

    #[test]
    fn stage_extensions() {
        assert_eq!(ShaderStage::Fragment.file_extension(), "frag");
        assert_eq!(ShaderStage::TessEvaluation.file_extension(), "tese");
    }
}
