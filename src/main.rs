//! Virtual gateway command-line tool

use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, bail};
use clap::Parser;
use tracing::{debug, error, info};

use vmcp_gateway::{
    cli::{Cli, Command},
    config::{Config, composite::CompositeToolConfig, validate_composite_tool_config},
    setup_tracing,
};

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Command::Validate { file } => run_validate(file.as_deref().or(cli.config.as_deref())),
        Command::ShowConfig => run_show_config(cli.config.as_deref()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("❌ {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Validate a configuration file, or a file holding a single composite tool
fn run_validate(path: Option<&Path>) -> anyhow::Result<()> {
    if let Some(p) = path
        && is_standalone_tool(p)?
    {
        let contents = std::fs::read_to_string(p)
            .with_context(|| format!("failed to read {}", p.display()))?;
        let tool: CompositeToolConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", p.display()))?;
        debug!(tool = %tool.name, "Validating standalone composite tool");
        report(validate_composite_tool_config(&tool.name, &tool), &tool.name)?;
        println!("✅ {} - valid ({} steps)", tool.name, tool.steps.len());
        return Ok(());
    }

    let config = Config::load(path).context("failed to load configuration")?;
    info!(
        composite_tools = config.composite_tools.len(),
        backends = config.backends.len(),
        "Validating configuration"
    );
    report(config.validate(), "configuration")?;

    println!(
        "✅ configuration valid: {} backend(s), {} composite tool(s)",
        config.backends.len(),
        config.composite_tools.len()
    );
    for tool in &config.composite_tools {
        println!("   {} - {} step(s)", tool.name, tool.steps.len());
    }
    Ok(())
}

fn report(result: vmcp_gateway::Result<()>, subject: &str) -> anyhow::Result<()> {
    let Err(e) = result else {
        return Ok(());
    };
    let message = e.to_string();
    let detail = message.strip_prefix("validation failed: ").unwrap_or(&message);
    for problem in detail.split("; ") {
        eprintln!("   - {problem}");
    }
    bail!("{subject} failed validation")
}

/// A top-level `steps` key marks a standalone composite tool file
fn is_standalone_tool(path: &Path) -> anyhow::Result<bool> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let doc: serde_yaml::Value = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(doc.get("steps").is_some())
}

fn run_show_config(path: Option<&Path>) -> anyhow::Result<()> {
    let config = Config::load(path).context("failed to load configuration")?;
    let yaml = serde_yaml::to_string(&config).context("failed to serialize configuration")?;
    print!("{yaml}");
    Ok(())
}
