//! Storage client driving external command-line tools.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use ltacp_checksum::{ChecksumAlgorithm, ChecksumPair, parse_trailing_checksum};

use crate::template::expand;
use crate::translate::parent_url;
use crate::{StorageClient, StorageError, StorageFuture};

/// argv templates for storage operations.
///
/// Placeholders: `{url}` (the object's SURL) and `{parent}` (its parent
/// directory). An empty template disables the operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageCommands {
    /// Prints the stored checksum as the last token of its output.
    #[serde(default)]
    pub checksum: Vec<String>,

    /// Creates `{parent}` and any missing ancestors.
    #[serde(default)]
    pub mkdir: Vec<String>,

    #[serde(default)]
    pub remove: Vec<String>,
}

/// [`StorageClient`] running one configured command per operation.
#[derive(Debug, Clone)]
pub struct CommandStorageClient {
    commands: StorageCommands,
}

impl CommandStorageClient {
    pub fn new(commands: StorageCommands) -> Self {
        Self { commands }
    }

    async fn run(
        &self,
        operation: &'static str,
        template: &[String],
        surl: &str,
    ) -> Result<String, StorageError> {
        let parent = parent_url(surl)?.unwrap_or_else(|| surl.to_string());
        let argv = expand(template, &[("url", surl), ("parent", parent.as_str())])?;
        debug!(operation, command = ?argv, "running storage command");

        let output = tokio::process::Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| StorageError::Spawn {
                program: argv[0].clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(StorageError::CommandFailed {
                operation,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl StorageClient for CommandStorageClient {
    fn query_checksum<'a>(
        &'a self,
        surl: &'a str,
        algorithm: ChecksumAlgorithm,
    ) -> StorageFuture<'a, Option<ChecksumPair>> {
        Box::pin(async move {
            if self.commands.checksum.is_empty() {
                return Err(StorageError::NotConfigured("checksum query"));
            }
            let stdout = self.run("checksum query", &self.commands.checksum, surl).await?;
            if stdout.trim().is_empty() {
                return Ok(None);
            }
            Ok(Some(parse_trailing_checksum(algorithm, &stdout)?))
        })
    }

    fn create_missing_parent_directories<'a>(&'a self, surl: &'a str) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            if self.commands.mkdir.is_empty() {
                debug!(%surl, "no mkdir command configured, skipping");
                return Ok(());
            }
            self.run("directory creation", &self.commands.mkdir, surl)
                .await
                .map(drop)
        })
    }

    fn remove_object<'a>(&'a self, surl: &'a str) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            if self.commands.remove.is_empty() {
                warn!(%surl, "no remove command configured, object left in place");
                return Ok(());
            }
            self.run("removal", &self.commands.remove, surl).await?;
            info!(%surl, "removed storage object");
            Ok(())
        })
    }
}
