// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! CLI command modules.

pub mod descriptors;
pub mod loopback;
pub mod validate;

use mxlink_core::{Config, ConfigLoader, MxError};

/// Load the configuration, falling back to defaults when the file is absent.
pub fn load_config(path: &str) -> Result<Config, MxError> {
    match ConfigLoader::load_file(path) {
        Err(MxError::ConfigNotFound { path }) => {
            tracing::info!(path = %path.display(), "No configuration file, using defaults");
            Ok(Config::default())
        }
        other => other,
    }
}
