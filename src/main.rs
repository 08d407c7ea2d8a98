//! pipeline-telemetry command line.
//!
//! ## Subcommands
//!
//! - `pipeline-telemetry demo` - Trace a sample chat turn into an in-memory
//!   store and print the resulting rows as JSON
//! - `pipeline-telemetry config [FILE]` - Print the effective configuration
//! - `pipeline-telemetry version` - Print the version

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use pipeline_telemetry::config::{self as telemetry_config, FileConfig, TelemetryConfig};
use pipeline_telemetry::logging::init_logging;
use pipeline_telemetry::service::default_backends;
use pipeline_telemetry::store::MemoryStore;
use pipeline_telemetry::{ModelCallParams, SpanType, Status, TelemetryService, TraceOptions};

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("help");

    match command {
        "demo" => {
            let config = match load_config(args.get(2).map(String::as_str)) {
                Ok(config) => config,
                Err(code) => return code,
            };
            if let Err(e) = init_logging(&config.log_config()) {
                eprintln!("Logging disabled: {}", e);
            }
            run_demo(&config).await
        }
        "config" => {
            let config = match load_config(args.get(2).map(String::as_str)) {
                Ok(config) => config,
                Err(code) => return code,
            };
            match serde_json::to_string_pretty(&config.effective_config()) {
                Ok(json) => {
                    println!("{}", json);
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("Failed to render config: {}", e);
                    ExitCode::FAILURE
                }
            }
        }
        "help" | "--help" | "-h" => {
            print_usage();
            ExitCode::SUCCESS
        }
        "version" | "--version" | "-V" => {
            println!("pipeline-telemetry {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
            ExitCode::FAILURE
        }
    }
}

/// Environment config, layered over `file` when given.
fn load_config(file: Option<&str>) -> Result<TelemetryConfig, ExitCode> {
    match file {
        None => Ok(telemetry_config::load()),
        Some(path) => match FileConfig::read(Path::new(path)) {
            Ok(file) => Ok(telemetry_config::load_with_file(&file)),
            Err(e) => {
                eprintln!("{}", e);
                Err(ExitCode::FAILURE)
            }
        },
    }
}

async fn run_demo(config: &TelemetryConfig) -> ExitCode {
    let store = Arc::new(MemoryStore::new());
    let service = TelemetryService::new(default_backends(config, store.clone()));

    let ctx = service
        .start_trace(
            "chat",
            TraceOptions::default()
                .user_id("demo-user")
                .session_id("demo-session"),
        )
        .await;

    let retrieved: Result<usize, std::io::Error> = service
        .span(&ctx, "retrieve", SpanType::Retrieval, |_span_id| async {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            Ok(3)
        })
        .await;
    let chunks = retrieved.unwrap_or(0);

    service
        .log_model_call(
            &ctx,
            ModelCallParams::new("answer", "demo-model")
                .tokens(420, 64)
                .duration_ms(850)
                .input_preview(format!("question with {} context chunks", chunks))
                .output_preview("demo answer"),
        )
        .await;
    service
        .log_event(
            &ctx,
            "chat_message",
            serde_json::json!({ "role": "assistant", "content": "demo answer" }),
        )
        .await;
    service.end_trace(&ctx, Status::Completed, None, None).await;
    service.flush().await;

    match store.export_json().await {
        Ok(json) => {
            println!("{}", json);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to export telemetry: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn print_usage() {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!(
        "pipeline-telemetry v{}

USAGE:
    pipeline-telemetry [COMMAND] [CONFIG_FILE]

COMMANDS:
    demo       Trace a sample chat turn and print the stored rows
    config     Show the effective configuration (secrets redacted)
    version    Show version information
    help       Show this help message

ENVIRONMENT:
    TELEMETRY_EXTERNAL_HOST, TELEMETRY_EXTERNAL_PUBLIC_KEY,
    TELEMETRY_EXTERNAL_SECRET_KEY   Enable the external sync backend
    TELEMETRY_SPOOL_DIR             Spool directory for external batches
    TELEMETRY_FLUSH_TIMEOUT_MS      External flush bound
    TELEMETRY_LOG_LEVEL, TELEMETRY_LOG_FORMAT",
        version
    );
}
