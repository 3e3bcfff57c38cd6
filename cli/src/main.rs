// Copyright (c) 2026 Synapse Contributors
// SPDX-License-Identifier: AGPL-3.0

//! # Synapse CLI
//!
//! Operational tooling for the Synapse orchestration engine:
//!
//! - `synapse validate` - Parse and validate workflow / policy manifests
//! - `synapse simulate` - Run a workflow end-to-end against echo ports
//! - `synapse verify-evidence` - Verify an exported audit evidence bundle

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

/// Synapse - agent orchestration & governance engine
#[derive(Parser)]
#[command(name = "synapse")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to engine configuration file
    #[arg(
        short,
        long,
        global = true,
        env = "SYNAPSE_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "SYNAPSE_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate workflow or policy set manifests
    Validate {
        /// Manifest files to validate
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Run a workflow end-to-end with echo ports standing in for external
    /// systems
    Simulate {
        /// Workflow manifest to run
        #[arg(short, long)]
        workflow: PathBuf,

        /// Policy set manifests to install first
        #[arg(short, long)]
        policies: Vec<PathBuf>,

        /// Tenant the run belongs to
        #[arg(short, long, default_value = "demo-tenant")]
        tenant: String,

        /// Run input as a JSON document
        #[arg(short, long, default_value = "{}")]
        input: String,

        /// Write the signed audit evidence bundle here afterwards
        #[arg(long)]
        export_evidence: Option<PathBuf>,
    },

    /// Verify an exported audit evidence bundle
    VerifyEvidence {
        /// Evidence bundle JSON file
        bundle: PathBuf,

        /// Signing key the bundle was exported with
        #[arg(short, long)]
        key: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = match &cli.config {
        Some(path) => synapse_core::infrastructure::config::EngineConfig::from_yaml_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => synapse_core::infrastructure::config::EngineConfig::default(),
    };

    match cli.command {
        Commands::Validate { files } => commands::validate(&files),
        Commands::Simulate {
            workflow,
            policies,
            tenant,
            input,
            export_evidence,
        } => {
            commands::simulate(
                &config,
                &workflow,
                &policies,
                &tenant,
                &input,
                export_evidence.as_deref(),
            )
            .await
        }
        Commands::VerifyEvidence { bundle, key } => commands::verify_evidence(&bundle, &key),
    }
}
