//! Shader bytecode library
//!
//! Bytecode is opaque: the library stores blobs keyed by program name and
//! stage and hands them to the device unchanged. On disk a program is a pair
//! of files `<name>.vert.spv` and `<name>.frag.spv`.

use crate::backend::traits::*;
use crate::backend::types::ShaderStage;
use std::collections::BTreeMap;
use std::path::Path;

fn stage_suffix(stage: ShaderStage) -> &'static str {
    match stage {
        ShaderStage::Vertex => "vert",
        ShaderStage::Fragment => "frag",
    }
}

#[derive(Debug, Clone, Default)]
pub struct ShaderLibrary {
    blobs: BTreeMap<(String, ShaderStage), Vec<u8>>,
}

impl ShaderLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, program: &str, stage: ShaderStage, code: Vec<u8>) {
        self.blobs.insert((program.to_string(), stage), code);
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with(mut self, program: &str, stage: ShaderStage, code: Vec<u8>) -> Self {
        self.insert(program, stage, code);
        self
    }

    pub fn get(&self, program: &str, stage: ShaderStage) -> BackendResult<&[u8]> {
        self.blobs
            .get(&(program.to_string(), stage))
            .map(|code| code.as_slice())
            .ok_or_else(|| {
                BackendError::ResourceNotFound(format!(
                    "shader {}.{}",
                    program,
                    stage_suffix(stage)
                ))
            })
    }

    pub fn contains(&self, program: &str) -> bool {
        [ShaderStage::Vertex, ShaderStage::Fragment]
            .iter()
            .all(|stage| self.blobs.contains_key(&(program.to_string(), *stage)))
    }

    /// Fail unless both stages of every listed program are present.
    pub fn require(&self, programs: &[&str]) -> BackendResult<()> {
        match programs.iter().find(|p| !self.contains(p)) {
            Some(missing) => Err(BackendError::ResourceNotFound(format!(
                "shader program '{}' needs both .vert.spv and .frag.spv",
                missing
            ))),
            None => Ok(()),
        }
    }

    /// Load every `<name>.<vert|frag>.spv` file in a directory.
    pub fn load_dir(dir: &Path) -> BackendResult<Self> {
        let mut library = Self::new();
        let entries = std::fs::read_dir(dir).map_err(|e| {
            BackendError::ShaderCreationFailed(format!("{}: {}", dir.display(), e))
        })?;

        for entry in entries {
            let path = entry
                .map_err(|e| BackendError::ShaderCreationFailed(e.to_string()))?
                .path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(stem) = file_name.strip_suffix(".spv") else {
                continue;
            };
            let (program, stage) = if let Some(program) = stem.strip_suffix(".vert") {
                (program, ShaderStage::Vertex)
            } else if let Some(program) = stem.strip_suffix(".frag") {
                (program, ShaderStage::Fragment)
            } else {
                log::warn!("Ignoring shader file without stage suffix: {}", path.display());
                continue;
            };

            let code = std::fs::read(&path).map_err(|e| {
                BackendError::ShaderCreationFailed(format!("{}: {}", path.display(), e))
            })?;
            log::debug!("Loaded shader {} ({} bytes)", file_name, code.len());
            library.insert(program, stage, code);
        }

        Ok(library)
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_stage_reported() {
        let library = ShaderLibrary::new().with("forward", ShaderStage::Vertex, vec![1, 2, 3]);
        assert!(library.get("forward", ShaderStage::Vertex).is_ok());
        assert!(library.get("forward", ShaderStage::Fragment).is_err());
        assert!(library.require(&["forward"]).is_err());
    }

    #[test]
    fn test_load_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("gradients.vert.spv"), [1u8, 2]).unwrap();
        std::fs::write(dir.path().join("gradients.frag.spv"), [3u8]).unwrap();
        std::fs::write(dir.path().join("readme.txt"), "x").unwrap();

        let library = ShaderLibrary::load_dir(dir.path()).unwrap();
        assert_eq!(library.len(), 2);
        assert_eq!(library.get("gradients", ShaderStage::Fragment).unwrap(), &[3u8]);
        assert!(library.require(&["gradients"]).is_ok());
    }
}
