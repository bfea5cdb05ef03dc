//! CLI binary entrypoint.

mod error;
mod format;

use clap::{Parser, Subcommand};
use error::{CliError, ExitCode};
use format::{ConfigFormatArg, OutputArgs, OutputMode};
use sensor_ingest_infra::{
    ConfigFormat, InfraError, SchemaStatus, ServiceReport, load_effective_config,
    load_effective_config_json, redact_if_secret, render_effective_config, run_until_shutdown,
    std_env_snapshot,
};
use sensor_ingest_shared::ErrorKind;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "sensor-ingest",
    version,
    about = "Signal K delta ingestion from MQTT into Postgres",
    long_about = None
)]
struct Cli {
    #[command(flatten)]
    output: OutputArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Subscribe to the broker and store metrics until SIGINT/SIGTERM (default).
    Run {
        /// Optional config file path (JSON/TOML).
        #[arg(long = "config")]
        path: Option<PathBuf>,
        /// Optional JSON overrides applied on top of the config file.
        #[arg(long)]
        overrides_json: Option<String>,
    },
    /// Config-related commands.
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigCommands {
    /// Validate config and environment.
    Check {
        /// Optional config file path (JSON/TOML).
        #[arg(long = "config")]
        path: Option<PathBuf>,
        /// Optional JSON overrides applied on top of the config file.
        #[arg(long)]
        overrides_json: Option<String>,
    },
    /// Print the effective config with secrets redacted.
    Show {
        /// Optional config file path (JSON/TOML).
        #[arg(long = "config")]
        path: Option<PathBuf>,
        /// Optional JSON overrides applied on top of the config file.
        #[arg(long)]
        overrides_json: Option<String>,
        /// Rendering of the effective config.
        #[arg(long, value_enum, default_value_t)]
        format: ConfigFormatArg,
    },
}

impl Default for Commands {
    fn default() -> Self {
        Self::Run {
            path: None,
            overrides_json: None,
        }
    }
}

#[derive(Debug)]
pub(crate) struct CliOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: ExitCode,
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    let mode = OutputMode::from_args(&cli.output);
    if let Err(error) = init_tracing() {
        let _ = writeln!(io::stderr(), "warn: tracing disabled: {error}");
    }

    let command = cli.command.unwrap_or_default();
    match run(&command, mode) {
        Ok(output) => match write_output(&output) {
            Ok(()) => std::process::ExitCode::from(output.exit_code.as_u8()),
            Err(error) => exit_with_error(&error),
        },
        Err(error) => exit_with_error(&error),
    }
}

/// Route `tracing` diagnostics from sqlx and rumqttc to stderr.
fn init_tracing() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(true)
        .try_init()
        .map_err(|error| anyhow::anyhow!(error))
}

fn exit_with_error(error: &CliError) -> std::process::ExitCode {
    let _ = writeln!(io::stderr(), "error: {error}");
    std::process::ExitCode::from(error.exit_code().as_u8())
}

fn run(command: &Commands, mode: OutputMode) -> Result<CliOutput, CliError> {
    match command {
        Commands::Run {
            path,
            overrides_json,
        } => run_service(mode, path.as_deref(), overrides_json.as_deref()),
        Commands::Config { command } => {
            let env = std_env_snapshot();
            match command {
                ConfigCommands::Check {
                    path,
                    overrides_json,
                } => config_check_with_env(mode, &env, path.as_deref(), overrides_json.as_deref()),
                ConfigCommands::Show {
                    path,
                    overrides_json,
                    format,
                } => config_show_with_env(
                    mode,
                    &env,
                    path.as_deref(),
                    overrides_json.as_deref(),
                    *format,
                ),
            }
        },
    }
}

fn run_service(
    mode: OutputMode,
    path: Option<&Path>,
    overrides_json: Option<&str>,
) -> Result<CliOutput, CliError> {
    let env = std_env_snapshot();
    let config = match load_effective_config(&env, path, overrides_json) {
        Ok(config) => config,
        Err(error) => return Ok(format_error_output(mode, &error, ExitCode::InvalidInput)),
    };

    let mut stderr = String::new();
    log_info(&mut stderr, "starting ingest service", mode.no_progress);
    // The service logs to stderr while running; flush progress before it starts.
    io::stderr().write_all(stderr.as_bytes())?;

    match run_until_shutdown(config) {
        Ok(report) => format_report(mode, &report),
        Err(error) => {
            let exit_code = infra_exit_code(&error);
            Ok(format_error_output(mode, &error, exit_code))
        },
    }
}

fn format_report(mode: OutputMode, report: &ServiceReport) -> Result<CliOutput, CliError> {
    let summary = &report.summary;
    let schema = schema_label(report.schema.as_ref());

    let mut stderr = String::new();
    log_info(&mut stderr, "ingest service stopped", mode.no_progress);

    let stdout = if mode.is_json() {
        let payload = serde_json::json!({
            "status": "ok",
            "schema": schema,
            "summary": {
                "received": summary.received,
                "ignored": summary.ignored,
                "decoded": summary.decoded,
                "rejected": summary.rejected,
                "dispatched": summary.dispatched,
                "dropped": summary.dropped,
                "abandonedWrites": summary.abandoned_writes,
            },
            "supervisorEvents": report.supervisor_events,
        });
        let mut output = serde_json::to_string_pretty(&payload)?;
        output.push('\n');
        output
    } else {
        format!(
            "status: ok\nschema: {schema}\nreceived: {}\nignored: {}\ndecoded: {}\nrejected: {}\ndispatched: {}\ndropped: {}\nabandoned_writes: {}\n",
            summary.received,
            summary.ignored,
            summary.decoded,
            summary.rejected,
            summary.dispatched,
            summary.dropped,
            summary.abandoned_writes,
        )
    };

    Ok(CliOutput {
        stdout,
        stderr,
        exit_code: ExitCode::Ok,
    })
}

const fn schema_label(status: Option<&SchemaStatus>) -> &'static str {
    match status {
        Some(SchemaStatus::Hypertable) => "hypertable",
        Some(SchemaStatus::PlainTable { .. }) => "plain_table",
        None => "unchanged",
    }
}

fn config_check_with_env(
    mode: OutputMode,
    env: &BTreeMap<String, String>,
    path: Option<&Path>,
    overrides_json: Option<&str>,
) -> Result<CliOutput, CliError> {
    let config_json = match load_effective_config_json(env, path, overrides_json) {
        Ok(config) => config,
        Err(error) => return Ok(format_error_output(mode, &error, ExitCode::InvalidInput)),
    };

    let mut stderr = String::new();
    log_info(&mut stderr, "config check completed", mode.no_progress);

    let stdout = if mode.is_json() {
        let config_value: serde_json::Value = serde_json::from_str(config_json.trim())?;
        let payload = serde_json::json!({
            "status": "ok",
            "configPath": path.map(|value| value.to_string_lossy().to_string()),
            "effectiveConfig": config_value,
        });
        let mut output = serde_json::to_string_pretty(&payload)?;
        output.push('\n');
        output
    } else {
        path.map_or_else(
            || "status: ok\nconfig: ok\n".to_string(),
            |value| format!("status: ok\nconfig: {}\n", value.display()),
        )
    };

    Ok(CliOutput {
        stdout,
        stderr,
        exit_code: ExitCode::Ok,
    })
}

fn config_show_with_env(
    mode: OutputMode,
    env: &BTreeMap<String, String>,
    path: Option<&Path>,
    overrides_json: Option<&str>,
    format: ConfigFormatArg,
) -> Result<CliOutput, CliError> {
    let rendered_format = match (mode.is_json(), format) {
        (true, _) | (false, ConfigFormatArg::Json) => ConfigFormat::Json,
        (false, ConfigFormatArg::Toml) => ConfigFormat::Toml,
    };
    let rendered = match render_effective_config(env, path, overrides_json, rendered_format) {
        Ok(rendered) => rendered,
        Err(error) => return Ok(format_error_output(mode, &error, ExitCode::InvalidInput)),
    };

    let stdout = if mode.is_json() {
        let config_value: serde_json::Value = serde_json::from_str(rendered.trim())?;
        let payload = serde_json::json!({
            "status": "ok",
            "configPath": path.map(|value| value.to_string_lossy().to_string()),
            "effectiveConfig": config_value,
        });
        let mut output = serde_json::to_string_pretty(&payload)?;
        output.push('\n');
        output
    } else if rendered.ends_with('\n') {
        rendered
    } else {
        format!("{rendered}\n")
    };

    Ok(CliOutput {
        stdout,
        stderr: String::new(),
        exit_code: ExitCode::Ok,
    })
}

pub(crate) fn format_error_output(
    mode: OutputMode,
    error: &InfraError,
    exit_code: ExitCode,
) -> CliOutput {
    let metadata: BTreeMap<String, String> = error
        .metadata
        .iter()
        .map(|(key, value)| (key.clone(), redact_if_secret(key, value)))
        .collect();

    let mut stderr = String::new();
    log_info(&mut stderr, "command failed", mode.no_progress);

    let stdout = if mode.is_json() {
        let payload = serde_json::json!({
            "status": "error",
            "error": {
                "code": error.code.to_string(),
                "message": error.message,
                "kind": error.kind.to_string(),
                "class": error.class.to_string(),
                "metadata": metadata,
            },
        });

        // This is a CLI boundary, so JSON serialization errors are internal.
        let mut output = serde_json::to_string_pretty(&payload).unwrap_or_else(|_| {
            "{\"status\":\"error\",\"error\":{\"code\":\"core:internal\",\"message\":\"internal error\",\"kind\":\"invariant\"}}".to_string()
        });
        output.push('\n');
        output
    } else {
        let mut output = format!(
            "status: error\ncode: {}\nmessage: {}\nkind: {}\n",
            error.code, error.message, error.kind
        );
        let lines: String = metadata
            .iter()
            .map(|(key, value)| format!("{key}: {value}\n"))
            .collect();
        output.push_str(&lines);
        output
    };

    CliOutput {
        stdout,
        stderr,
        exit_code,
    }
}

pub(crate) const fn infra_exit_code(error: &InfraError) -> ExitCode {
    match error.kind {
        ErrorKind::Expected => ExitCode::InvalidInput,
        ErrorKind::Invariant | ErrorKind::Unexpected => ExitCode::Internal,
    }
}

fn log_info(stderr: &mut String, message: &str, no_progress: bool) {
    if no_progress {
        return;
    }
    stderr.push_str("info: ");
    stderr.push_str(message);
    stderr.push('\n');
}

fn write_output(output: &CliOutput) -> Result<(), CliError> {
    let mut stdout = io::stdout();
    stdout.write_all(output.stdout.as_bytes())?;

    if !output.stderr.is_empty() {
        let mut stderr = io::stderr();
        stderr.write_all(output.stderr.as_bytes())?;
        stderr.flush()?;
    }

    Ok(())
}
