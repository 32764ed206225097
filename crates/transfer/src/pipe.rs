//! Local named pipe between the relay and the upload client.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// A named pipe owned by one session. Removed on drop.
#[derive(Debug)]
pub struct LocalPipe {
    path: PathBuf,
    removed: bool,
}

impl LocalPipe {
    /// Creates the pipe with owner-only permissions.
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: c_path is a valid NUL-terminated string for the call.
        let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        debug!(pipe = %path.display(), "local pipe created");
        Ok(Self {
            path,
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Releases a writer blocked opening the pipe while no reader exists.
    ///
    /// Opening the read end without blocking lets the pending open
    /// complete; the read end is closed again right away.
    pub fn unblock_writer(&self) {
        if self.removed {
            return;
        }
        unblock_writer_at(&self.path);
    }

    /// Removes the pipe. Returns `false` if it was already removed.
    pub fn remove(&mut self) -> io::Result<bool> {
        if self.removed {
            return Ok(false);
        }
        self.removed = true;
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(pipe = %self.path.display(), "local pipe removed");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// [`LocalPipe::unblock_writer`] for a pipe known only by path.
pub fn unblock_writer_at(path: &Path) {
    match std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
    {
        Ok(reader) => drop(reader),
        Err(e) => {
            debug!(pipe = %path.display(), error = %e, "pipe not opened for unblocking");
        }
    }
}

impl Drop for LocalPipe {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            warn!(pipe = %self.path.display(), error = %e, "failed to remove local pipe");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::FileTypeExt;
    use std::time::Duration;

    use super::*;

    #[test]
    fn create_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.fifo");

        let mut pipe = LocalPipe::create(&path).unwrap();
        assert!(std::fs::metadata(&path).unwrap().file_type().is_fifo());

        assert!(pipe.remove().unwrap());
        assert!(!path.exists());
        assert!(!pipe.remove().unwrap());
    }

    #[test]
    fn existing_path_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.fifo");
        let _first = LocalPipe::create(&path).unwrap();
        let err = LocalPipe::create(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn drop_removes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.fifo");
        drop(LocalPipe::create(&path).unwrap());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn unblocks_pending_writer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.fifo");
        let pipe = LocalPipe::create(&path).unwrap();

        let writer = tokio::spawn({
            let path = path.clone();
            async move { tokio::fs::OpenOptions::new().write(true).open(&path).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!writer.is_finished());

        // Retry until the writer's open is actually pending in the kernel.
        let opened = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                pipe.unblock_writer();
                if writer.is_finished() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(opened.is_ok());
        assert!(writer.await.unwrap().is_ok());
    }
}
