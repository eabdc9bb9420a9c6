//! Private working directory shared with the external trainer.

use std::path::{Path, PathBuf};

use fedlink_core::{FederationError, ModelBlob};
use tokio::io::AsyncWriteExt;

pub const MODEL_FILE: &str = "model.bin";
pub const UPDATE_FILE: &str = "update.bin";

/// Directory (mode 0700) holding `model.bin` and `update.bin` (mode 0600).
#[derive(Debug, Clone)]
pub struct WorkingDir {
    root: PathBuf,
}

fn io_failure(path: &Path, e: std::io::Error) -> FederationError {
    FederationError::TrainingFailure(format!("{}: {e}", path.display()))
}

impl WorkingDir {
    pub async fn create(root: impl Into<PathBuf>) -> Result<Self, FederationError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await.map_err(|e| io_failure(&root, e))?;
        restrict(&root, 0o700).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path { &self.root }

    pub fn model_path(&self) -> PathBuf { self.root.join(MODEL_FILE) }

    pub fn update_path(&self) -> PathBuf { self.root.join(UPDATE_FILE) }

    /// Created owner-only; an existing file is narrowed before it is rewritten.
    pub async fn write_model(&self, model: &ModelBlob) -> Result<(), FederationError> {
        let path = self.model_path();
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            restrict(&path, 0o600).await?;
        }
        let mut opts = tokio::fs::OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        opts.mode(0o600);
        let mut file = opts.open(&path).await.map_err(|e| io_failure(&path, e))?;
        file.write_all(model.as_bytes()).await.map_err(|e| io_failure(&path, e))?;
        file.flush().await.map_err(|e| io_failure(&path, e))
    }

    /// Removes any previous update so a trainer that writes nothing is caught.
    pub async fn clear_update(&self) -> Result<(), FederationError> {
        let path = self.update_path();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_failure(&path, e)),
        }
    }

    pub async fn read_update(&self) -> Result<ModelBlob, FederationError> {
        let path = self.update_path();
        restrict(&path, 0o600).await?;
        let bytes = tokio::fs::read(&path).await.map_err(|e| io_failure(&path, e))?;
        Ok(ModelBlob::from(bytes))
    }
}

#[cfg(unix)]
async fn restrict(path: &Path, mode: u32) -> Result<(), FederationError> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await.map_err(|e| io_failure(path, e))
}

#[cfg(not(unix))]
async fn restrict(_path: &Path, _mode: u32) -> Result<(), FederationError> { Ok(()) }
