//! CLI Module
//!
//! Provides command-line interface functionality including:
//! - Exit codes for automation
//! - Text and JSON report output

pub mod exit_codes;
pub mod output;

pub use exit_codes::{exit_code_description, exit_code_for, print_exit_codes, CliResult, ExitCodes};
pub use output::{hex_preview, OutputFormat};
