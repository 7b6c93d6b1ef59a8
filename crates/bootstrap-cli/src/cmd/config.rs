use crate::output::print_json;
use anyhow::Context;
use bootstrap_core::config::{ConfigSource, WarnLevel};
use clap::Subcommand;
use std::path::Path;

#[derive(Subcommand, Debug)]
pub enum ConfigSubcommand {
    /// Print the effective configuration and where it came from
    Show,

    /// Validate the config for common mistakes
    Validate,
}

pub fn run(
    root: &Path,
    config_path: Option<&Path>,
    subcmd: ConfigSubcommand,
    json: bool,
) -> anyhow::Result<()> {
    match subcmd {
        ConfigSubcommand::Show => show(root, config_path, json),
        ConfigSubcommand::Validate => validate(root, config_path, json),
    }
}

fn describe(source: &ConfigSource) -> String {
    match source {
        ConfigSource::Explicit(path) => format!("{} (explicit)", path.display()),
        ConfigSource::Project(path) => path.display().to_string(),
        ConfigSource::Builtin => "built-in defaults".to_string(),
    }
}

// ---------------------------------------------------------------------------
// show
// ---------------------------------------------------------------------------

fn show(root: &Path, config_path: Option<&Path>, json: bool) -> anyhow::Result<()> {
    let (config, source) = super::load_config(root, config_path)?;
    if json {
        return print_json(&serde_json::json!({
            "source": source,
            "config": config,
        }));
    }
    println!("# source: {}", describe(&source));
    print!("{}", config.to_yaml().context("failed to render config")?);
    Ok(())
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

fn validate(root: &Path, config_path: Option<&Path>, json: bool) -> anyhow::Result<()> {
    let (config, source) = super::load_config(root, config_path)?;
    let warnings = config.validate();

    if json {
        print_json(&serde_json::json!({
            "source": source,
            "warnings": warnings,
        }))?;
    } else if warnings.is_empty() {
        println!("Config is valid. No warnings.");
    } else {
        for w in &warnings {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {}", w.message);
        }
    }

    if warnings.iter().any(|w| w.level == WarnLevel::Error) {
        anyhow::bail!("config validation found errors");
    }
    Ok(())
}
