mod admission;
mod checks;
mod config;
mod engine;
mod fix;
mod mutation;
mod output;
mod quantity;
mod resources;
mod schema;
mod validators;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::info;

use crate::config::{Configuration, Severity};
use crate::engine::CheckEngine;
use crate::output::OutputFormat;
use crate::resources::ResourceProvider;

#[derive(Parser)]
#[command(name = "polaris", about = "Kubernetes workload configuration auditor")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Audit manifests on disk and report the results
    Audit {
        /// File or directory of YAML manifests to audit
        #[arg(long, default_value = ".", env = "POLARIS_AUDIT_PATH")]
        audit_path: PathBuf,
        /// Path to the configuration file
        #[arg(long, env = "POLARIS_CONFIG")]
        config: Option<PathBuf>,
        /// Output format
        #[arg(long, default_value = "json", value_parser = parse_format)]
        format: OutputFormat,
        /// Write the report to a file instead of stdout
        #[arg(long)]
        output_file: Option<PathBuf>,
        /// POST the report to a URL
        #[arg(long)]
        output_url: Option<String>,
        /// Exit 3 when any danger-severity check fails
        #[arg(long)]
        set_exit_code_on_danger: bool,
        /// Exit 4 when the score falls below this value
        #[arg(long, default_value_t = 0)]
        set_exit_code_below_score: u64,
        /// Drop passing checks from the report
        #[arg(long)]
        only_show_failed_tests: bool,
        /// Drop results below this severity from the report
        #[arg(long, default_value = "ignore", value_parser = parse_severity)]
        severity_level: Severity,
    },
    /// Rewrite manifests in place using the mutations of failing checks
    Fix {
        /// File or directory of YAML manifests to fix
        #[arg(long, required = true)]
        files_path: PathBuf,
        /// Path to the configuration file
        #[arg(long, env = "POLARIS_CONFIG")]
        config: Option<PathBuf>,
        /// Comma-separated check IDs to fix, or "all" / "none"
        #[arg(long)]
        checks: Option<String>,
        /// Treat files as templates with non-YAML templating directives
        #[arg(long)]
        template: bool,
    },
    /// Run the validating/mutating admission webhook
    Webhook {
        /// Port to listen on
        #[arg(long, default_value_t = 9876, env = "POLARIS_PORT")]
        port: u16,
        /// Path to the configuration file
        #[arg(long, env = "POLARIS_CONFIG")]
        config: Option<PathBuf>,
    },
}

fn parse_format(s: &str) -> Result<OutputFormat, String> {
    match s {
        "json" => Ok(OutputFormat::Json),
        "yaml" => Ok(OutputFormat::Yaml),
        "score" => Ok(OutputFormat::Score),
        other => Err(format!("unknown format '{other}', expected json, yaml, or score")),
    }
}

fn parse_severity(s: &str) -> Result<Severity, String> {
    match s {
        "ignore" => Ok(Severity::Ignore),
        "warning" => Ok(Severity::Warning),
        "danger" | "error" => Ok(Severity::Danger),
        other => Err(format!(
            "unknown severity '{other}', expected ignore, warning, or danger"
        )),
    }
}

fn load_config(path: Option<&PathBuf>) -> Configuration {
    Configuration::load(path.map(|p| p.as_path())).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}");
        std::process::exit(1);
    })
}

fn build_engine(config: Configuration) -> CheckEngine {
    CheckEngine::new(config).unwrap_or_else(|e| {
        eprintln!("Failed to initialize checks: {e}");
        std::process::exit(1);
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match cli.command {
        Command::Audit {
            audit_path,
            config,
            format,
            output_file,
            output_url,
            set_exit_code_on_danger,
            set_exit_code_below_score,
            only_show_failed_tests,
            severity_level,
        } => {
            let engine = build_engine(load_config(config.as_ref()));
            let provider = ResourceProvider::from_path(&audit_path).unwrap_or_else(|e| {
                eprintln!("Failed to load resources from {}: {e}", audit_path.display());
                std::process::exit(1);
            });

            let mut audit = engine.run_audit(&provider);
            audit.filter_by_severity(severity_level);
            if only_show_failed_tests {
                audit.remove_successful_results();
            }

            let summary = audit.summary();
            info!(
                score = audit.score,
                successes = summary.successes,
                warnings = summary.warnings,
                dangers = summary.dangers,
                "audit complete"
            );

            let rendered = audit.render(format).unwrap_or_else(|e| {
                eprintln!("Failed to render report: {e}");
                std::process::exit(1);
            });

            if let Some(path) = output_file {
                if let Err(e) = std::fs::write(&path, &rendered) {
                    eprintln!("Failed to write report to {}: {e}", path.display());
                    return ExitCode::from(1);
                }
            } else {
                println!("{rendered}");
            }

            if let Some(url) = output_url {
                if let Err(e) = post_report(&url, &rendered, format).await {
                    eprintln!("Failed to POST report to {url}: {e}");
                    return ExitCode::from(1);
                }
            }

            if set_exit_code_below_score > 0 && u64::from(audit.score) < set_exit_code_below_score
            {
                eprintln!(
                    "Score {} is below the threshold of {set_exit_code_below_score}",
                    audit.score
                );
                return ExitCode::from(4);
            }
            if set_exit_code_on_danger && summary.dangers > 0 {
                eprintln!("{} danger-severity checks failed", summary.dangers);
                return ExitCode::from(3);
            }
            ExitCode::SUCCESS
        }
        Command::Fix {
            files_path,
            config,
            checks,
            template,
        } => {
            let mut config = load_config(config.as_ref());
            if let Some(list) = checks {
                config.mutations = match list.as_str() {
                    "all" => config.checks.keys().cloned().collect(),
                    "none" => Vec::new(),
                    list => list.split(',').map(|s| s.trim().to_string()).collect(),
                };
            }
            let engine = build_engine(config);
            match fix::execute(&engine, &files_path, template) {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("Fix failed: {e}");
                    ExitCode::from(1)
                }
            }
        }
        Command::Webhook { port, config } => {
            let engine = build_engine(load_config(config.as_ref()));
            match admission::serve(engine, port).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("Webhook failed: {e}");
                    ExitCode::from(1)
                }
            }
        }
    }
}

async fn post_report(
    url: &str,
    body: &str,
    format: OutputFormat,
) -> Result<(), reqwest::Error> {
    let response = reqwest::Client::new()
        .post(url)
        .header("Content-Type", format.content_type())
        .body(body.to_string())
        .send()
        .await?;
    response.error_for_status()?;
    Ok(())
}
