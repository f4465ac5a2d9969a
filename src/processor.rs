// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Resolves the (emitter, format, target) triple to a mode+extension,
//! constructs the dumper and emitter, and exposes setup/put/tick/shutdown.

use crate::dumper::{new_dumper, DumperArgs, Format, Target};
use crate::emitter::{new_emitter, Emitter, EmitterArgs, EmitterName, Mode};
use crate::error::{ConfigError, LifecycleError, VxcapError};
use crate::record::PacketRecord;
use std::time::SystemTime;

/// Arguments to construct a `Processor`. Mirrors the CLI surface: which
/// emitter, which dumper format/target, and every sink-specific field.
pub struct ProcessorArgs {
    pub emitter_name: EmitterName,
    pub format: Format,
    pub target: Target,
    pub enable_json_text: bool,
    pub enable_json_raw: bool,

    pub fs_filename: String,
    pub fs_dirpath: String,

    pub aws_region: Option<String>,
    pub aws_s3_bucket: Option<String>,
    pub aws_s3_prefix: String,
    pub aws_s3_add_time_key: bool,
    pub aws_s3_flush_count: usize,
    pub aws_s3_flush_interval_secs: u64,

    pub aws_firehose_name: Option<String>,
    pub aws_firehose_flush_size: usize,
    pub aws_firehose_flush_interval_secs: u64,
}

/// Resolved (mode, extension, dumper-format) triple for one compatibility
/// matrix entry in spec.md §4.5. `dumper_format` may differ from the
/// requested format: writing JSON to a stream file requires newline
/// delimiting to stay line-parseable, while a per-record event stream
/// (firehose) keeps the separator-free form.
struct Resolved {
    mode: Mode,
    extension: &'static str,
    dumper_format: Format,
}

fn resolve(emitter_name: EmitterName, format: Format, target: Target) -> Option<Resolved> {
    use EmitterName::*;
    use Format::*;
    use Target::*;

    match (emitter_name, format, target) {
        (Fs, Pcap, Packet) => Some(Resolved {
            mode: Mode::Stream,
            extension: "pcap",
            dumper_format: Pcap,
        }),
        (Fs, Json, Packet) => Some(Resolved {
            mode: Mode::Stream,
            extension: "json",
            dumper_format: Ndjson,
        }),
        (S3, Pcap, Packet) => Some(Resolved {
            mode: Mode::Stream,
            extension: "pcap",
            dumper_format: Pcap,
        }),
        (S3, Json, Packet) => Some(Resolved {
            mode: Mode::Stream,
            extension: "json",
            dumper_format: Ndjson,
        }),
        (Firehose, Json, Packet) => Some(Resolved {
            mode: Mode::Stream,
            extension: "json",
            dumper_format: Json,
        }),
        _ => None,
    }
}

/// Controls both the dumper (log encoder) and the emitter (log forwarder).
/// Works as the interface of log processing via `put`.
pub struct Processor {
    emitter: Box<dyn Emitter>,
    ready: bool,
}

impl Processor {
    pub fn new(args: ProcessorArgs) -> Result<Self, ConfigError> {
        let resolved = resolve(args.emitter_name, args.format, args.target).ok_or_else(|| {
            ConfigError::UnsupportedCombination {
                emitter: format!("{:?}", args.emitter_name),
                format: format!("{:?}", args.format),
                target: format!("{:?}", args.target),
            }
        })?;

        let dumper = new_dumper(DumperArgs {
            format: resolved.dumper_format,
            target: args.target,
            enable_json_text: args.enable_json_text,
            enable_json_raw: args.enable_json_raw,
        })
        .expect("resolve() only yields (format, target) pairs valid for new_dumper");

        let emitter_args = EmitterArgs {
            name: args.emitter_name,
            mode: resolved.mode,
            extension: resolved.extension.to_string(),
            dumper,
            fs_filename: args.fs_filename,
            fs_dirpath: args.fs_dirpath,
            aws_region: args.aws_region,
            aws_s3_bucket: args.aws_s3_bucket,
            aws_s3_prefix: args.aws_s3_prefix,
            aws_s3_add_time_key: args.aws_s3_add_time_key,
            aws_s3_flush_count: args.aws_s3_flush_count,
            aws_s3_flush_interval_secs: args.aws_s3_flush_interval_secs,
            aws_firehose_name: args.aws_firehose_name,
            aws_firehose_flush_size: args.aws_firehose_flush_size,
            aws_firehose_flush_interval_secs: args.aws_firehose_flush_interval_secs,
        };

        let emitter = new_emitter(emitter_args)?;

        Ok(Processor {
            emitter,
            ready: false,
        })
    }

    /// Must be invoked before calling `put`.
    pub async fn setup(&mut self) -> Result<(), VxcapError> {
        self.emitter.setup().await?;
        self.ready = true;
        Ok(())
    }

    /// Forwards a singleton batch to the emitter.
    pub async fn put(&mut self, record: PacketRecord) -> Result<(), VxcapError> {
        if !self.ready {
            return Err(LifecycleError::NotReady.into());
        }
        self.emitter.emit(vec![record]).await?;
        Ok(())
    }

    /// Forwards to the emitter's tick.
    pub async fn tick(&mut self, now: SystemTime) -> Result<(), VxcapError> {
        self.emitter.tick(now).await?;
        Ok(())
    }

    /// Calls the emitter's teardown. The only path to clean exit.
    pub async fn shutdown(&mut self) -> Result<(), VxcapError> {
        self.emitter.teardown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args(emitter_name: EmitterName, format: Format) -> ProcessorArgs {
        ProcessorArgs {
            emitter_name,
            format,
            target: Target::Packet,
            enable_json_text: false,
            enable_json_raw: false,
            fs_filename: "dump".to_string(),
            fs_dirpath: ".".to_string(),
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

    #[test]
    fn unsupported_triple_is_rejected_at_construction() {
        let args = base_args(EmitterName::Firehose, Format::Pcap);
        let err = Processor::new(args).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedCombination { .. }));
    }

    #[tokio::test]
    async fn put_before_setup_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut args = base_args(EmitterName::Fs, Format::Json);
        args.fs_dirpath = dir.path().to_str().unwrap().to_string();
        let mut processor = Processor::new(args).unwrap();

        let record = PacketRecord::new(
            &[0u8; 14],
            crate::vxlan::VxlanHeader {
                flags: 0,
                group_policy_id: 0,
                vni: 0,
                reserved: 0,
            },
        );
        let err = processor.put(record).await.unwrap_err();
        assert!(matches!(err, VxcapError::Lifecycle(LifecycleError::NotReady)));
    }
}
