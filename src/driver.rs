// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The main loop: drains the receive queue, ticks the processor once a
//! second, and shuts down cleanly on SIGTERM/SIGINT.

use crate::error::VxcapError;
use crate::processor::Processor;
use crate::vxlan::{self, QueueItem};
use std::time::{Duration, SystemTime};
use tracing::{error, info, warn};

/// Runs until a termination signal arrives or the listener reports a
/// terminal socket error. Calls `processor.setup()` before entering the
/// loop. Only the signal paths run `processor.shutdown()` on the way out;
/// a listener error propagates immediately, matching the original's
/// signal-only clean-shutdown contract.
pub async fn run(mut processor: Processor, port: u16, receiver_queue_size: usize) -> Result<(), VxcapError> {
    processor.setup().await?;

    let mut queue = vxlan::listen(port, receiver_queue_size);
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(crate::error::SocketError::ReadFailed)?;

    loop {
        #[cfg(unix)]
        let terminated = sigterm.recv();
        #[cfg(not(unix))]
        let terminated = std::future::pending::<Option<()>>();

        tokio::select! {
            item = queue.recv() => {
                match item {
                    Some(QueueItem::Record(record)) => {
                        if let Err(err) = processor.put(record).await {
                            error!(error = %err, "failed to emit record");
                            return Err(err);
                        }
                    }
                    Some(QueueItem::Error(err)) => {
                        error!(error = %err, "listener terminated");
                        return Err(err.into());
                    }
                    None => {
                        warn!("receive queue closed unexpectedly");
                        return Ok(());
                    }
                }
            }
            _ = ticker.tick() => {
                if let Err(err) = processor.tick(SystemTime::now()).await {
                    error!(error = %err, "tick failed");
                    return Err(err);
                }
            }
            _ = terminated => {
                info!("received SIGTERM, shutting down");
                return processor.shutdown().await.map_err(Into::into);
            }
            result = tokio::signal::ctrl_c() => {
                if result.is_ok() {
                    info!("received SIGINT, shutting down");
                }
                return processor.shutdown().await.map_err(Into::into);
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::dumper::{Format, Target};
    use crate::emitter::EmitterName;
    use crate::processor::{Processor, ProcessorArgs};

    fn fs_json_args(dirpath: &str) -> ProcessorArgs {
        ProcessorArgs {
            emitter_name: EmitterName::Fs,
            format: Format::Json,
            target: Target::Packet,
            enable_json_text: false,
            enable_json_raw: false,
            fs_filename: "dump.json".to_string(),
            fs_dirpath: dirpath.to_string(),
            aws_region: None,
            aws_s3_bucket: None,
            aws_s3_prefix: String::new(),
            aws_s3_add_time_key: false,
            aws_s3_flush_count: 0,
            aws_s3_flush_interval_secs: 0,
            aws_firehose_name: None,
            aws_firehose_flush_size: 0,
            aws_firehose_flush_interval_secs: 0,
        }
    }

    /// Scenario (i): start the driver with a dummy (fs) processor bound to an
    /// ephemeral port, let at least one 1-Hz tick elapse, then deliver the
    /// conventional termination signal. `run` must observe the signal and
    /// return cleanly, which only happens by calling `processor.shutdown()`.
    #[tokio::test(flavor = "multi_thread")]
    async fn signal_triggers_clean_shutdown_after_a_tick() {
        let dir = tempfile::tempdir().unwrap();
        let processor = Processor::new(fs_json_args(dir.path().to_str().unwrap())).unwrap();

        let handle = tokio::spawn(run(processor, 0, 16));

        // Give the driver time to complete setup and observe at least one
        // 1-Hz tick before the signal arrives.
        tokio::time::sleep(Duration::from_millis(1_100)).await;

        // SAFETY: `libc::raise` delivers a signal to the current process;
        // it has no memory-safety preconditions.
        unsafe {
            assert_eq!(libc::raise(libc::SIGTERM), 0);
        }

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("driver should exit after SIGTERM")
            .expect("driver task should not panic");

        assert!(result.is_ok(), "shutdown should complete without error: {result:?}");
    }
}
