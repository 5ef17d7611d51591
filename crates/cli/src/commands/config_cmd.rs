//! `parley config`: Configuration management commands.

use clap::Subcommand;
use parley_config::AppConfig;
use std::path::Path;

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the default configuration (the default action)
    Default,

    /// Print the effective configuration, env overrides applied
    Show,

    /// Load and validate the configuration
    Validate,
}

pub fn run(
    action: Option<ConfigAction>,
    path: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    match action.unwrap_or(ConfigAction::Default) {
        ConfigAction::Default => print!("{}", AppConfig::default_toml()),
        ConfigAction::Show => show(path)?,
        ConfigAction::Validate => validate(path)?,
    }
    Ok(())
}

fn show(path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load(path).map_err(|e| format!("Failed to load config: {e}"))?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

fn validate(path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let shown = path
        .map(Path::to_path_buf)
        .unwrap_or_else(AppConfig::default_path);
    println!("Validating {}", shown.display());

    match AppConfig::load(path) {
        Ok(config) => {
            let mut warnings = Vec::new();
            if config.agent.introduction.is_empty() {
                warnings.push("agent.introduction is empty: agents will wait for the caller");
            }
            if config.agent.transfer_timeout_secs == 0 {
                warnings.push("agent.transfer_timeout_secs is 0: transfers end the call at once");
            }

            println!("   Config parsed successfully");
            for w in &warnings {
                println!("   warning: {w}");
            }
            println!();
            println!("   Server:   {}", config.server.bind_addr());
            println!("   Context:  {} events", config.agent.max_context_length);
            println!("   Log:      {}", config.log.level);
        }
        Err(e) => {
            println!("   Config error: {e}");
            return Err(e.into());
        }
    }

    Ok(())
}
