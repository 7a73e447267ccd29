use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use vkcore_reflect::{GlslangCompiler, ShaderStage};

// ---- Probe config (probe.toml) --------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Where to write one `<name>.toml` manifest per compiled shader.
    #[serde(default, with = "opt_path_serde")]
    pub dump_manifests: Option<PathBuf>,
    #[serde(default)]
    pub compiler: CompilerConfig,
    /// Extra shaders to compile and reflect alongside the built-in ones.
    #[serde(default)]
    pub shader: Vec<ShaderEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CompilerConfig {
    #[serde(with = "path_serde")]
    pub executable: PathBuf,
    pub target_env: String,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        let glslang = GlslangCompiler::default();
        Self {
            executable: glslang.executable,
            target_env: glslang.target_env,
        }
    }
}

impl CompilerConfig {
    pub fn compiler(&self) -> GlslangCompiler {
        GlslangCompiler {
            executable: self.executable.clone(),
            target_env: self.target_env.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ShaderEntry {
    pub name: String,
    /// Relative paths resolve against the config file's directory.
    #[serde(with = "path_serde")]
    pub file: PathBuf,
    pub stage: ShaderStage,
}

impl ProbeConfig {
    pub fn load(path: &Path) -> eyre::Result<Self> {
        let mut config: ProbeConfig = toml::from_str(&std::fs::read_to_string(path)?)?;
        let base = path.parent().unwrap_or(Path::new("."));
        for entry in &mut config.shader {
            if entry.file.is_relative() {
                entry.file = base.join(&entry.file);
            }
        }
        Ok(config)
    }
}

// ---- Serde helpers: forward-slash paths -----------------------------

mod path_serde {
    use std::path::PathBuf;

    use path_slash::PathBufExt as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(path: &PathBuf, s: S) -> Result<S::Ok, S::Error> {
        path.to_slash_lossy().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<PathBuf, D::Error> {
        Ok(PathBuf::from_slash(String::deserialize(d)?))
    }
}

mod opt_path_serde {
    use std::path::PathBuf;

    use path_slash::PathBufExt as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(path: &Option<PathBuf>, s: S) -> Result<S::Ok, S::Error> {
        path.as_ref().map(|p| p.to_slash_lossy().into_owned()).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<PathBuf>, D::Error> {
        Ok(Option::<String>::deserialize(d)?.map(PathBuf::from_slash))
    }
}

#[cfg(test)]
mod tests {
    use path_slash::PathBufExt as _;

    use super::*;

    #[test]
    fn parses_full_config() {
        let text = r#"
            dump_manifests = "out/manifests"

            [compiler]
            executable = "tools/glslangValidator"
            target_env = "vulkan1.3"

            [[shader]]
            name = "material"
            file = "shaders/material.frag"
            stage = "fragment"
        "#;
        let config: ProbeConfig = toml::from_str(text).unwrap();
        assert_eq!(config.dump_manifests, Some(PathBuf::from_slash("out/manifests")));
        assert_eq!(config.compiler.target_env, "vulkan1.3");
        assert_eq!(config.shader.len(), 1);
        assert_eq!(config.shader[0].stage, ShaderStage::Fragment);
        assert_eq!(config.shader[0].file, PathBuf::from_slash("shaders/material.frag"));
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config: ProbeConfig = toml::from_str("").unwrap();
        assert!(config.dump_manifests.is_none());
        assert!(config.shader.is_empty());
        assert_eq!(config.compiler.executable, PathBuf::from("glslangValidator"));
    }

    #[test]
    fn paths_serialize_with_forward_slashes() {
        let config = ProbeConfig {
            dump_manifests: Some(PathBuf::from("out").join("manifests")),
            ..Default::default()
        };
        let text = toml::to_string(&config).unwrap();
        assert!(text.contains("dump_manifests = \"out/manifests\""));
    }
}
