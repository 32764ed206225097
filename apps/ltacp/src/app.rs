//! Wires configuration into a coordinator and runs one transfer.

use std::process::ExitCode;
use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use ltacp_storage::{CommandStorageClient, StaticUrlTable};
use ltacp_transfer::{TransferCoordinator, TransferRequest};

use crate::config::AppConfig;

pub async fn run(
    config: AppConfig,
    source: &str,
    destination: &str,
    json_output: bool,
) -> anyhow::Result<ExitCode> {
    let request = TransferRequest::from_source_arg(source, destination)?;
    let translator = StaticUrlTable::new(&config.url_table, &config.passthrough_schemes)?;
    let storage = CommandStorageClient::new(config.storage);

    let cancel = CancellationToken::new();
    let coordinator = TransferCoordinator::new(
        config.transfer,
        Arc::new(translator),
        Arc::new(storage),
        cancel.clone(),
    );

    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, cancelling transfer");
            cancel.cancel();
        }
    });
    let result = coordinator.run(&request).await;
    interrupt.abort();

    match result {
        Ok(checksums) => {
            if json_output {
                let report = json!({
                    "status": "succeeded",
                    "source": request.source(),
                    "destination": request.destination_url,
                    "checksums": checksums,
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "{} -> {}: {} bytes, {}, {}",
                    request.source(),
                    request.destination_url,
                    checksums.bytes,
                    checksums.md5,
                    checksums.adler32
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            if json_output {
                let report = json!({
                    "status": "failed",
                    "source": request.source(),
                    "destination": request.destination_url,
                    "error": e.to_string(),
                    "local": e.is_local(),
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                eprintln!("ltacp: {e}");
            }
            Ok(ExitCode::FAILURE)
        }
    }
}
