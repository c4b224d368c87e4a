//! Wires the uploader to the terminal: logging hooks, Ctrl-C and automatic
//! resume after a failed chunk.

use std::path::Path;
use std::sync::Arc;

use sliceup_uploader::{
    HookEvent, HookKind, HookRegistry, Phase, SliceUploader, UploadError, UploadFile,
    UploadOptions,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;

/// Uploads `path` and returns once it is merged, paused by Ctrl-C, or has
/// failed for good.
pub async fn run(config: Config, path: &Path) -> anyhow::Result<()> {
    let file = UploadFile::open(path)?;
    info!(file = %file.name(), size = file.len(), "uploading");

    let options = UploadOptions::new().hooks(logging_hooks());
    let uploader = Arc::new(SliceUploader::with_default_transport(
        config.upload.clone(),
        options,
    )?);

    let interrupted = CancellationToken::new();
    let signal = {
        let uploader = Arc::clone(&uploader);
        let interrupted = interrupted.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("SIGINT received, cancelling upload");
                interrupted.cancel();
                uploader.cancel();
            }
        })
    };
    let reporter = config
        .progress_interval()
        .map(|every| tokio::spawn(report_progress(Arc::clone(&uploader), every)));

    let mut result = uploader.start(file).await;
    let mut attempts = 0;
    while let Err(UploadError::RetryExhausted { index, .. }) = &result {
        if interrupted.is_cancelled() || attempts >= config.resume_attempts {
            break;
        }
        attempts += 1;
        warn!(
            chunk = index,
            attempt = attempts,
            of = config.resume_attempts,
            "chunk kept failing, resuming"
        );
        tokio::select! {
            _ = interrupted.cancelled() => break,
            _ = tokio::time::sleep(config.resume_delay()) => {}
        }
        result = uploader.resume().await;
    }

    signal.abort();
    if let Some(reporter) = reporter {
        reporter.abort();
    }

    let state = uploader.state();
    match result {
        Ok(()) => {
            let response = state
                .merge_response
                .as_ref()
                .map(|r| r.text())
                .unwrap_or_default();
            info!(
                file_hash = state.file_hash.as_deref().unwrap_or_default(),
                chunks = state.chunks.len(),
                response = %response,
                "upload complete"
            );
            Ok(())
        }
        Err(UploadError::Cancelled) => {
            info!(
                uploaded = state.uploaded_chunks(),
                chunks = state.chunks.len(),
                "upload paused"
            );
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn logging_hooks() -> HookRegistry {
    let mut hooks = HookRegistry::new();
    hooks
        .on(HookKind::BeforeFileHash, |event| {
            if let HookEvent::BeforeFileHash { chunk_count, .. } = event {
                info!(chunks = chunk_count, "hashing file");
            }
            Ok(())
        })
        .on(HookKind::FileHashSuccess, |event| {
            if let HookEvent::FileHashSuccess { file_hash, .. } = event {
                info!(%file_hash, "file hashed");
            }
            Ok(())
        })
        .on(HookKind::UploadChunkSuccess, |event| {
            if let HookEvent::UploadChunkSuccess {
                index,
                uploaded,
                total,
                ..
            } = event
            {
                debug!(chunk = index, uploaded, total, "chunk uploaded");
            }
            Ok(())
        })
        .on(HookKind::UploadChunkError, |event| {
            if let HookEvent::UploadChunkError { index, error, .. } = event {
                if !error.is_aborted() {
                    warn!(chunk = index, %error, "chunk upload failed");
                }
            }
            Ok(())
        })
        .on(HookKind::BeforeMergeChunk, |_| {
            info!("all chunks uploaded, merging");
            Ok(())
        });
    hooks
}

async fn report_progress(uploader: Arc<SliceUploader>, every: std::time::Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let state = uploader.state();
        if state.phase != Phase::Uploading {
            continue;
        }
        info!(
            progress = %format!("{:.1}%", state.upload_progress),
            uploaded = state.uploaded_chunks(),
            chunks = state.chunks.len(),
            speed = %format!("{:.0} KiB/s", state.bytes_per_second / 1024.0),
            eta = %state
                .eta
                .map(|eta| format!("{}s", eta.as_secs()))
                .unwrap_or_else(|| "-".into()),
            "uploading"
        );
    }
}
