//! Output format helpers for CLI commands.

use clap::{Args, ValueEnum};

/// Output format choices for CLI responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-friendly text output.
    Text,
    /// Machine-friendly JSON output.
    Json,
}

/// Output-related CLI flags.
#[derive(Debug, Args)]
pub struct OutputArgs {
    /// Output format for command responses.
    #[arg(long, global = true, value_enum)]
    pub output: Option<OutputFormat>,
    /// Suppress progress output on stderr.
    #[arg(long, global = true)]
    pub no_progress: bool,
    /// Emit machine-readable JSON output (alias for `--output json`).
    #[arg(long, global = true)]
    pub json: bool,
}

/// Output mode derived from CLI flags.
#[derive(Debug, Clone, Copy)]
pub struct OutputMode {
    pub format: OutputFormat,
    pub no_progress: bool,
}

impl OutputMode {
    /// Build output mode from CLI flags.
    #[must_use]
    pub const fn from_args(args: &OutputArgs) -> Self {
        let format = match (args.output, args.json) {
            (Some(value), _) => value,
            (None, true) => OutputFormat::Json,
            (None, false) => OutputFormat::Text,
        };
        Self {
            format,
            no_progress: args.no_progress,
        }
    }

    /// Returns true when JSON output is requested.
    #[must_use]
    pub const fn is_json(self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }
}

/// Rendering of the effective config for `config show`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ConfigFormatArg {
    /// Pretty JSON.
    #[default]
    Json,
    /// Pretty TOML.
    Toml,
}
