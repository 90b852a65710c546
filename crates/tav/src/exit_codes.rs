//! Exit codes for the CLI

use tav_core::TavError;

use crate::cli::commands::{InvalidSuites, TasksFailed};

/// Success
pub const SUCCESS: u8 = 0;

/// General error
pub const ERROR: u8 = 1;

/// Configuration error
pub const CONFIG_ERROR: u8 = 2;

/// One or more tasks failed
pub const TEST_FAILURE: u8 = 3;

/// Pick the exit code for a top-level error
pub fn for_error(error: &anyhow::Error) -> u8 {
    if error.downcast_ref::<TasksFailed>().is_some() {
        return TEST_FAILURE;
    }
    if error.downcast_ref::<InvalidSuites>().is_some() {
        return CONFIG_ERROR;
    }

    match error.downcast_ref::<TavError>() {
        Some(TavError::Config(_)) | Some(TavError::Matrix(_)) => CONFIG_ERROR,
        _ => ERROR,
    }
}
