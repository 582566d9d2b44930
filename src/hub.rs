//! Locating pretrained model artifacts.

use std::path::{Path, PathBuf};

use hf_hub::api::sync::{Api, ApiRepo};
use tracing::debug;

use crate::error::{InferenceError, Result};

/// Where a model's files come from: an existing local directory, or a
/// Hugging Face hub repository fetched into the local hub cache.
pub enum ModelSource {
    Local(PathBuf),
    Hub(ApiRepo),
}

impl ModelSource {
    /// Interprets `model` as a local directory when one exists at that path,
    /// otherwise as a hub repo id such as `Salesforce/codet5-small`.
    pub fn new(model: &str) -> Result<Self> {
        let path = Path::new(model);
        if path.is_dir() {
            return Ok(Self::Local(path.to_path_buf()));
        }
        let api = Api::new()?;
        Ok(Self::Hub(api.model(model.to_string())))
    }

    /// Returns the local path of `filename`, downloading it if needed.
    pub fn get(&self, filename: &str) -> Result<PathBuf> {
        match self {
            Self::Local(dir) => {
                let path = dir.join(filename);
                if !path.is_file() {
                    return Err(InferenceError::Io(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("{} not found", path.display()),
                    )));
                }
                Ok(path)
            }
            Self::Hub(repo) => {
                let path = repo.get(filename)?;
                debug!("Resolved {} to {:?}", filename, path);
                Ok(path)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_directory_source() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tokenizer.json"), "{}").unwrap();

        let source = ModelSource::new(dir.path().to_str().unwrap()).unwrap();
        assert!(matches!(source, ModelSource::Local(_)));

        let path = source.get("tokenizer.json").unwrap();
        assert_eq!(path, dir.path().join("tokenizer.json"));
    }

    #[test]
    fn test_missing_local_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = ModelSource::Local(dir.path().to_path_buf());

        let err = source.get("model.safetensors").unwrap_err();
        assert!(matches!(err, InferenceError::Io(_)));
    }
}
