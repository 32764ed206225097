//! Transfer coordinator.
//!
//! Drives one [`TransferSession`] through
//! `Idle → PortsAllocated → RemoteAgentLaunched → Streaming → Verifying`
//! and into `Succeeded` or `Failed`, tearing the session down before it
//! returns.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ltacp_checksum::ChecksumAlgorithm;
use ltacp_data_channel::{PortAllocator, RelaySplitter};
use ltacp_remote::{RemoteAgent, RemoteShell, RemoteStep};
use ltacp_storage::{StorageClient, UploadSink, UrlTranslator};

use crate::config::TransferConfig;
use crate::error::{MismatchKind, TransferError};
use crate::process::{ProcessHandle, StageOutput};
use crate::session::{HandleId, Side, TransferSession};
use crate::stages;
use crate::types::{TransferRequest, TransferState, VerifiedChecksums};

/// Runs verified transfers.
pub struct TransferCoordinator {
    config: TransferConfig,
    translator: Arc<dyn UrlTranslator>,
    storage: Arc<dyn StorageClient>,
    cancel: CancellationToken,
}

impl TransferCoordinator {
    /// `cancel` aborts every running attempt with [`TransferError::Cancelled`].
    pub fn new(
        config: TransferConfig,
        translator: Arc<dyn UrlTranslator>,
        storage: Arc<dyn StorageClient>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            translator,
            storage,
            cancel,
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Moves `request` into storage and verifies it end to end.
    ///
    /// Every port, pipe and helper of the attempt is released before this
    /// returns, whatever the outcome.
    pub async fn run(&self, request: &TransferRequest) -> Result<VerifiedChecksums, TransferError> {
        request.validate()?;
        let mut session = TransferSession::new(request.clone(), &self.cancel);
        info!(
            session = %session.id(),
            source = %request.source(),
            destination = %request.destination_url,
            "transfer started"
        );

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TransferError::Cancelled),
            result = self.drive(&mut session) => result,
        };

        let result = match result {
            Ok(checksums) => session
                .transition(TransferState::Succeeded)
                .map(|()| checksums),
            Err(e) => Err(e),
        };
        if result.is_err()
            && !session.state().is_terminal()
            && let Err(e) = session.transition(TransferState::Failed)
        {
            warn!(session = %session.id(), error = %e, "could not mark session failed");
        }
        session.teardown().await;

        match &result {
            Ok(checksums) => info!(
                session = %session.id(),
                md5 = %checksums.md5.value,
                adler32 = %checksums.adler32.value,
                bytes = checksums.bytes,
                "transfer verified"
            ),
            Err(e) => error!(session = %session.id(), error = %e, "transfer failed"),
        }
        result
    }

    async fn drive(&self, session: &mut TransferSession) -> Result<VerifiedChecksums, TransferError> {
        let config = &self.config;
        let request = session.request().clone();

        // Idle -> PortsAllocated
        let seed = match config.port_seed {
            Some(seed) => seed,
            None => {
                let id = session.id().to_string();
                PortAllocator::seed_from(&[
                    request.source_host.as_str(),
                    request.source_path.as_str(),
                    id.as_str(),
                ])
            }
        };
        let mut ports = PortAllocator::new(
            config.bind_address,
            config.port_range(),
            config.max_bind_attempts,
            seed,
        )
        .map_err(TransferError::from_bind)?;
        let data_listener = ports.bind().await.map_err(TransferError::from_bind)?;
        let report_listener = ports.bind().await.map_err(TransferError::from_bind)?;
        let (data_port, checksum_port) = (data_listener.port(), report_listener.port());
        session.set_ports(data_port, checksum_port);
        session.transition(TransferState::PortsAllocated)?;

        // PortsAllocated -> RemoteAgentLaunched
        let turl = self
            .translator
            .translate(&request.destination_url)
            .map_err(TransferError::UrlTranslation)?;
        self.storage
            .create_missing_parent_directories(&request.destination_url)
            .await
            .map_err(TransferError::Storage)?;

        let pipe_name = session.pipe_name()?;
        let remote_pipe = format!(
            "{}/{pipe_name}",
            config.remote.fifo_dir.trim_end_matches('/')
        );
        let agent = RemoteAgent::new(
            RemoteShell::new(&config.remote, &request.source_user, &request.source_host),
            request.source_path.as_str(),
            remote_pipe,
            config.broker_host(),
            config.remote.network_send.clone(),
        );
        let kind = agent.probe().await?;
        debug!(session = %session.id(), ?kind, "source probed");

        let local_pipe = session.create_local_pipe(&config.local_pipe_dir.join(&pipe_name))?;
        session.create_remote_pipe(agent.clone()).await?;
        session.transition(TransferState::RemoteAgentLaunched)?;

        // RemoteAgentLaunched -> Streaming
        session.transition(TransferState::Streaming)?;
        let mut splitter = RelaySplitter::new(config.chunk_size, config.queue_depth);
        let md5_tap = splitter.tap();
        let adler_tap = splitter.tap();
        let upload_tap = splitter.tap();
        let cancel = session.cancel_token();
        let timeout = config.accept_timeout();

        let relay = session.spawn_stage(
            "data relay",
            stages::relay(data_listener, splitter, timeout, cancel.clone()),
        );
        let report = session.spawn_stage(
            "checksum report",
            stages::checksum_report(report_listener, timeout, cancel),
        );
        let local_md5 = session.spawn_stage(
            "md5 checksum",
            stages::checksum(ChecksumAlgorithm::Md5, md5_tap),
        );
        let local_adler = session.spawn_stage(
            "adler32 checksum",
            stages::checksum(ChecksumAlgorithm::Adler32, adler_tap),
        );

        let sink = UploadSink::new(&config.upload, &local_pipe, turl);
        debug!(session = %session.id(), command = %sink.description(), "starting upload client");
        let upload = session.spawn_process(
            "upload client",
            sink.command().map_err(TransferError::Storage)?,
            Side::Local,
        )?;
        let upload_exited = session
            .handle(upload)
            .map(ProcessHandle::exited)
            .ok_or_else(|| TransferError::InvalidRequest("upload client not registered".into()))?;
        let writer = session.spawn_stage(
            "pipe writer",
            stages::pipe_writer(local_pipe.clone(), upload_tap, upload_exited),
        );

        let data_command = agent.data_command(kind, data_port)?;
        debug!(session = %session.id(), command = %data_command.description, "starting remote data stream");
        let remote_data =
            session.spawn_process("remote data stream", data_command.command, Side::Remote)?;

        let checksum_command = agent.checksum_command(checksum_port);
        debug!(session = %session.id(), command = %checksum_command.description, "starting remote checksum");
        let remote_checksum =
            session.spawn_process("remote checksum", checksum_command.command, Side::Remote)?;
        info!(session = %session.id(), data_port, checksum_port, "streaming");

        // Streaming -> Verifying
        wait_remote(session, remote_data, RemoteStep::DataStream).await?;
        wait_remote(session, remote_checksum, RemoteStep::Checksum).await?;
        let remote_md5 = session.wait(report).await?.into_checksum("checksum report")?;
        let local_md5 = session.wait(local_md5).await?.into_checksum("md5 checksum")?;
        session.transition(TransferState::Verifying)?;

        if !remote_md5.matches(&local_md5) {
            return Err(TransferError::ChecksumMismatch {
                kind: MismatchKind::Transit,
                expected: remote_md5,
                actual: Some(local_md5),
            });
        }
        debug!(session = %session.id(), md5 = %local_md5.value, "transit checksum verified");

        let bytes = session.wait(relay).await?.into_bytes("data relay")?;
        session.wait(writer).await?;
        session.wait(upload).await?;
        let local_adler = session
            .wait(local_adler)
            .await?
            .into_checksum("adler32 checksum")?;

        // An unavailable metadata query counts as a storage mismatch.
        let stored = match self
            .storage
            .query_checksum(&request.destination_url, ChecksumAlgorithm::Adler32)
            .await
        {
            Ok(stored) => stored,
            Err(e) => {
                warn!(
                    session = %session.id(),
                    surl = %request.destination_url,
                    error = %e,
                    "stored checksum query failed"
                );
                None
            }
        };
        match stored {
            Some(stored) if stored.matches(&local_adler) => {}
            actual => {
                self.discard_corrupt(&request.destination_url).await;
                return Err(TransferError::ChecksumMismatch {
                    kind: MismatchKind::Storage,
                    expected: local_adler,
                    actual,
                });
            }
        }

        Ok(VerifiedChecksums {
            md5: local_md5,
            adler32: local_adler,
            bytes,
        })
    }

    async fn discard_corrupt(&self, surl: &str) {
        if !self.config.remove_corrupt_object {
            warn!(%surl, "stored object does not match, leaving it in place");
            return;
        }
        match self.storage.remove_object(surl).await {
            Ok(()) => warn!(%surl, "removed stored object with mismatching checksum"),
            Err(e) => warn!(%surl, error = %e, "failed to remove mismatching object"),
        }
    }
}

/// Waits for a remote command and maps a non-zero exit to
/// [`TransferError::RemoteCommandFailure`], unless a broker stage failed
/// first and took the remote side down with it.
async fn wait_remote(
    session: &mut TransferSession,
    id: HandleId,
    step: RemoteStep,
) -> Result<(), TransferError> {
    match session.wait(id).await? {
        StageOutput::Exited { status, .. } if status.success() => Ok(()),
        StageOutput::Exited { status, stderr } => {
            if let Some(cause) = session.local_failure_cause() {
                debug!(%step, %status, "remote failure follows a local failure");
                return Err(cause);
            }
            Err(TransferError::RemoteCommandFailure {
                step,
                status,
                stderr,
            })
        }
        other => Err(TransferError::LocalProcessPrematureExit {
            stage: step.to_string(),
            detail: format!("unexpected stage output {other:?}"),
        }),
    }
}
