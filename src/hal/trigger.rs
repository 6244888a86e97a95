use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::traits::TriggerSource;
use crate::error::EisResult;

/// Trigger signalled by an external application creating a file.
///
/// Consuming the trigger deletes the file.
#[derive(Debug, Clone)]
pub struct FileTrigger {
    path: PathBuf,
}

impl FileTrigger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TriggerSource for FileTrigger {
    async fn is_ready(&self) -> EisResult<bool> {
        Ok(tokio::fs::try_exists(&self.path).await?)
    }

    async fn consume(&self) -> EisResult<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!("Consumed trigger {:?}", self.path);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("Trigger {:?} vanished before it was consumed", self.path);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn clear(&self) -> EisResult<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!("Cleared stale trigger {:?}", self.path);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
