// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use std::process::ExitCode;
use tracing::error;
use vxcap::cli::Cli;
use vxcap::driver;
use vxcap::processor::Processor;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_new(&cli.log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let processor = match Processor::new(cli.processor_args()) {
        Ok(processor) => processor,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    match driver::run(processor, cli.port, cli.receiver_queue_size).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "vxcap exited with an error");
            ExitCode::FAILURE
        }
    }
}
