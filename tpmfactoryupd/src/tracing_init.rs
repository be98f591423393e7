// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! [`tracing`] support: stderr for warnings, optionally a log file with the
//! full debug stream.

use std::path::Path;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

/// Initialize tracing. With a log path, everything from debug level up goes
/// to the file and only warnings reach stderr; without one, stderr gets
/// warnings and nothing is persisted.
pub fn init(log_path: Option<&Path>) -> std::io::Result<()> {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .with_filter(tracing::level_filters::LevelFilter::WARN);

    match log_path {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(file)
                .with_filter(tracing::level_filters::LevelFilter::DEBUG);
            tracing_subscriber::registry()
                .with(stderr_layer)
                .with(file_layer)
                .init();
        }
        None => {
            tracing_subscriber::registry().with(stderr_layer).init();
        }
    }
    Ok(())
}
