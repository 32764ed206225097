//! Upload client driver.
//!
//! The upload client reads the payload from the session's local named pipe
//! and writes it to the TURL. [`write_pipe`] feeds the pipe from a relay
//! consumer.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::debug;
use url::Url;

use ltacp_data_channel::ChunkStream;

use crate::StorageError;
use crate::template::expand;

/// Upload client argv template.
///
/// Placeholders: `{source}` (pipe path), `{source_url}` (pipe as a
/// `file://` URL) and `{destination}` (the TURL).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadClientConfig {
    #[serde(default = "default_command")]
    pub command: Vec<String>,
}

fn default_command() -> Vec<String> {
    vec![
        "globus-url-copy".into(),
        "{source_url}".into(),
        "{destination}".into(),
    ]
}

impl Default for UploadClientConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
        }
    }
}

/// One upload: the pipe to read from and the TURL to write to.
#[derive(Debug, Clone)]
pub struct UploadSink {
    template: Vec<String>,
    pipe_path: PathBuf,
    turl: String,
}

impl UploadSink {
    pub fn new(
        config: &UploadClientConfig,
        pipe_path: impl Into<PathBuf>,
        turl: impl Into<String>,
    ) -> Self {
        Self {
            template: config.command.clone(),
            pipe_path: pipe_path.into(),
            turl: turl.into(),
        }
    }

    pub fn pipe_path(&self) -> &Path {
        &self.pipe_path
    }

    pub fn turl(&self) -> &str {
        &self.turl
    }

    /// Expanded upload client argv.
    pub fn argv(&self) -> Result<Vec<String>, StorageError> {
        let source = self.pipe_path.to_string_lossy();
        let source_url = Url::from_file_path(&self.pipe_path)
            .map_err(|()| StorageError::InvalidUrl {
                url: source.to_string(),
                reason: "pipe path must be absolute".into(),
            })?
            .to_string();
        expand(
            &self.template,
            &[
                ("source", source.as_ref()),
                ("source_url", source_url.as_str()),
                ("destination", self.turl.as_str()),
            ],
        )
    }

    /// Upload client process, ready to spawn.
    pub fn command(&self) -> Result<std::process::Command, StorageError> {
        let argv = self.argv()?;
        let mut cmd = std::process::Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        Ok(cmd)
    }

    pub fn description(&self) -> String {
        match self.argv() {
            Ok(argv) => format!("upload client: {}", argv.join(" ")),
            Err(_) => format!("upload client -> {}", self.turl),
        }
    }
}

/// Drains `stream` into the named pipe at `path`.
///
/// Opening blocks until the upload client opens the read end. Returns the
/// number of bytes written.
pub async fn write_pipe(path: &Path, mut stream: ChunkStream) -> Result<u64, StorageError> {
    let mut pipe = tokio::fs::OpenOptions::new().write(true).open(path).await?;
    debug!(pipe = %path.display(), "pipe opened for writing");

    let mut written: u64 = 0;
    while let Some(chunk) = stream.next_chunk().await? {
        pipe.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    pipe.flush().await?;
    debug!(pipe = %path.display(), written, "pipe writer finished");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use ltacp_data_channel::RelaySplitter;

    use super::*;

    fn sink(template: &[&str]) -> UploadSink {
        let config = UploadClientConfig {
            command: template.iter().map(|w| w.to_string()).collect(),
        };
        UploadSink::new(&config, "/tmp/ltacp-x.fifo", "gsiftp://h/obs1.tar")
    }

    #[test]
    fn default_template_uses_file_url() {
        let sink = UploadSink::new(
            &UploadClientConfig::default(),
            "/tmp/ltacp-x.fifo",
            "gsiftp://h/obs1.tar",
        );
        assert_eq!(
            sink.argv().unwrap(),
            ["globus-url-copy", "file:///tmp/ltacp-x.fifo", "gsiftp://h/obs1.tar"]
        );
    }

    #[test]
    fn plain_path_template() {
        let sink = sink(&["cp", "{source}", "/archive/out.bin"]);
        let cmd = sink.command().unwrap();
        assert_eq!(cmd.get_program(), "cp");
        assert!(sink.description().starts_with("upload client: cp /tmp/ltacp-x.fifo"));
    }

    #[test]
    fn relative_pipe_rejected_for_url() {
        let config = UploadClientConfig::default();
        let sink = UploadSink::new(&config, "relative.fifo", "gsiftp://h/x");
        assert!(matches!(sink.argv(), Err(StorageError::InvalidUrl { .. })));
    }

    #[tokio::test]
    async fn writes_stream_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.bin");
        let data = vec![42u8; 10_000];
        // write_pipe never creates its target.
        std::fs::write(&target, b"").unwrap();

        let mut splitter = RelaySplitter::new(1024, 2);
        let tap = splitter.tap();
        let writer = tokio::spawn({
            let target = target.clone();
            async move { write_pipe(&target, tap).await }
        });

        splitter.run(&data[..]).await.unwrap();

        assert_eq!(writer.await.unwrap().unwrap(), data.len() as u64);
        assert_eq!(std::fs::read(&target).unwrap(), data);
    }
}
