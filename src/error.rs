// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for the `vxcap` pipeline.

/// Invalid CLI/argument combinations, unsupported (emitter, format, target)
/// triples, and missing required fields.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unsupported combination: emitter={emitter:?} format={format:?} target={target:?}")]
    UnsupportedCombination {
        emitter: String,
        format: String,
        target: String,
    },
    #[error("missing required config: {0}")]
    MissingConfig(&'static str),
}

/// Bind/open/read failures on the UDP listener. Terminal: the listener
/// publishes one of these and the queue closes.
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("failed to open UDP socket on port {port}: {source}")]
    OpenFailed {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read from UDP socket: {0}")]
    ReadFailed(#[source] std::io::Error),
}

/// Short datagram or header unpack failure. Per-datagram, logged and
/// skipped by the listener — never surfaced across the queue boundary.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("datagram too short for VXLAN header: {0} bytes")]
    ShortDatagram(usize),
}

/// Dumper serialization/writer errors.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("writer is not open")]
    WriterNotOpen,
    #[error("failed to encode record: {0}")]
    EncodeFailed(String),
    #[error("failed to write record: {0}")]
    WriteFailed(#[source] std::io::Error),
}

/// File create/write failures (fs), upload failures (s3), batch-put
/// failures (firehose).
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("failed to create dump file {path}: {source}")]
    FileCreateFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("S3 upload failed: {0}")]
    S3UploadFailed(String),
    #[error("firehose PutRecordBatch failed: {0}")]
    FirehosePutFailed(String),
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

/// `put` before `setup`; `write` on a dumper before `open`.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("processor is not ready, call setup() first")]
    NotReady,
}

/// Aggregate error surfaced through the driver loop. `ParseError` is
/// deliberately absent: it never crosses the listener/driver boundary.
#[derive(Debug, thiserror::Error)]
pub enum VxcapError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}
