// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Command-line surface. Parses into a `ProcessorArgs` plus the listener and
//! logging knobs the processor doesn't own.

use crate::dumper::{Format, Target};
use crate::emitter::EmitterName;
use crate::processor::ProcessorArgs;
use crate::vxlan::{DEFAULT_RECEIVER_QUEUE_SIZE, DEFAULT_VXLAN_PORT};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "vxcap",
    about = "Capture VXLAN-encapsulated traffic, decapsulate inner frames, and forward records"
)]
pub struct Cli {
    /// Where decapsulated records are forwarded.
    #[arg(short = 'e', long, value_enum, default_value = "fs")]
    pub emitter: EmitterName,

    /// Wire encoding for each record.
    #[arg(short = 'd', long = "dumper", value_enum, default_value = "pcap")]
    pub format: Format,

    /// Unit of encoding. Only `packet` is currently implemented.
    #[arg(long, value_enum, default_value = "packet")]
    pub target: Target,

    /// `trace`, `debug`, `info`, `warn`, or `error`.
    #[arg(long, default_value = "info")]
    pub log_level: String,

    #[arg(short = 'p', long, default_value_t = DEFAULT_VXLAN_PORT)]
    pub port: u16,

    #[arg(long, default_value_t = DEFAULT_RECEIVER_QUEUE_SIZE)]
    pub receiver_queue_size: usize,

    #[arg(long, default_value = "dump")]
    pub fs_filename: String,

    #[arg(long, default_value = ".")]
    pub fs_dirpath: String,

    #[arg(long)]
    pub aws_region: Option<String>,

    #[arg(long)]
    pub aws_s3_bucket: Option<String>,

    #[arg(long, default_value = "")]
    pub aws_s3_prefix: String,

    #[arg(long)]
    pub aws_s3_add_time_key: bool,

    /// 0 means fall back to the emitter's built-in default.
    #[arg(long, default_value_t = 0)]
    pub aws_s3_flush_count: usize,

    #[arg(long, default_value_t = 0)]
    pub aws_s3_flush_interval_secs: u64,

    #[arg(long)]
    pub aws_firehose_name: Option<String>,

    #[arg(long, default_value_t = 0)]
    pub aws_firehose_flush_size: usize,

    #[arg(long, default_value_t = 0)]
    pub aws_firehose_flush_interval_secs: u64,

    /// Include a UTF-8 (lossy) decoding of the application payload in JSON output.
    #[arg(long)]
    pub enable_json_text: bool,

    /// Include a base64 encoding of the application payload in JSON output.
    #[arg(long)]
    pub enable_json_raw: bool,
}

impl Cli {
    pub fn processor_args(&self) -> ProcessorArgs {
        ProcessorArgs {
            emitter_name: self.emitter,
            format: self.format,
            target: self.target,
            enable_json_text: self.enable_json_text,
            enable_json_raw: self.enable_json_raw,
            fs_filename: self.fs_filename.clone(),
            fs_dirpath: self.fs_dirpath.clone(),
            aws_region: self.aws_region.clone(),
            aws_s3_bucket: self.aws_s3_bucket.clone(),
            aws_s3_prefix: self.aws_s3_prefix.clone(),
            aws_s3_add_time_key: self.aws_s3_add_time_key,
            aws_s3_flush_count: self.aws_s3_flush_count,
            aws_s3_flush_interval_secs: self.aws_s3_flush_interval_secs,
            aws_firehose_name: self.aws_firehose_name.clone(),
            aws_firehose_flush_size: self.aws_firehose_flush_size,
            aws_firehose_flush_interval_secs: self.aws_firehose_flush_interval_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_fs_pcap_packet() {
        let cli = Cli::parse_from(["vxcap"]);
        assert_eq!(cli.emitter, EmitterName::Fs);
        assert_eq!(cli.format, Format::Pcap);
        assert_eq!(cli.target, Target::Packet);
        assert_eq!(cli.port, DEFAULT_VXLAN_PORT);
    }

    #[test]
    fn overrides_are_parsed() {
        let cli = Cli::parse_from(["vxcap", "-e", "s3", "-d", "json", "-p", "5000", "--aws-region", "us-east-1"]);
        assert_eq!(cli.emitter, EmitterName::S3);
        assert_eq!(cli.format, Format::Json);
        assert_eq!(cli.port, 5000);
        assert_eq!(cli.aws_region.as_deref(), Some("us-east-1"));
    }
}
