// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Capture VXLAN-encapsulated traffic, decapsulate the inner Ethernet frames,
//! encode them into one of several record formats, and forward the records to
//! a configurable sink.

pub mod cli;
pub mod driver;
pub mod dumper;
pub mod emitter;
pub mod error;
pub mod processor;
pub mod record;
pub mod vxlan;
