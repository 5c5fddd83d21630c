//! Configuration file management command

use anyhow::{Context, Result};
use console::style;
use partimg_core::Settings;
use std::path::PathBuf;

/// Arguments for the config command
pub struct ConfigArgs {
    /// Initialize a new configuration file with defaults
    pub init: bool,
    /// Show the path to the configuration file
    pub path: bool,
    /// Show configuration in JSON format
    pub json: bool,
    /// Suppress output (for scripting)
    pub silent: bool,
    /// Custom configuration file path (overrides default)
    pub config_file: Option<PathBuf>,
}

/// Execute the config command
pub fn execute(args: ConfigArgs) -> Result<()> {
    // Determine the effective config path
    let config_path = args.config_file.clone().or_else(Settings::config_path);

    // Handle --path flag
    if args.path {
        if let Some(path) = &config_path {
            if !args.silent {
                println!("{}", path.display());
            }
        } else if !args.silent {
            eprintln!("{}", style("Could not determine config path").yellow());
        }
        return Ok(());
    }

    // Handle --init flag
    if args.init {
        return init_config(config_path, args.silent);
    }

    // Default: show current configuration
    show_config(config_path, args.json, args.silent)
}

/// Initialize a new configuration file with default values
fn init_config(config_path: Option<PathBuf>, silent: bool) -> Result<()> {
    let path = config_path.context("Could not determine configuration directory")?;

    if path.exists() {
        if !silent {
            eprintln!(
                "{} Configuration file already exists at: {}",
                style("Warning:").yellow(),
                path.display()
            );
            eprintln!("Use a text editor to modify it, or delete it to re-initialize.");
        }
        return Ok(());
    }

    let settings = Settings::default();
    let saved_path = settings
        .save_to_path(Some(path))
        .context("Failed to save configuration file")?;

    if !silent {
        println!(
            "{} Created configuration file at: {}",
            style("Success:").green(),
            saved_path.display()
        );
        println!();
        println!("You can edit this file to customize default settings.");
        println!("Example settings:");
        println!();
        println!("  [engine]");
        println!("  rescue = true          # Salvage blocks with bad sectors");
        println!("  raw_block_size = 4096  # Block size for raw imaging");
        println!();
        println!("  [progress]");
        println!("  style = \"plain\"        # bar, plain, gauge or none");
    }

    Ok(())
}

/// Show the current configuration
fn show_config(config_path: Option<PathBuf>, json: bool, silent: bool) -> Result<()> {
    if silent {
        return Ok(());
    }

    let config_exists = config_path.as_ref().is_some_and(|p| p.exists());
    let settings = Settings::load_from_path(config_path.clone());

    if json {
        // Output as JSON for scripting
        let json_output = serde_json::to_string_pretty(&settings)
            .context("Failed to serialize settings to JSON")?;
        println!("{}", json_output);
    } else {
        // Human-readable output
        println!("{}", style("partimg Configuration").bold());
        println!();

        if let Some(path) = &config_path {
            if config_exists {
                println!("  {} {}", style("Config file:").dim(), path.display());
            } else {
                println!(
                    "  {} {} {}",
                    style("Config file:").dim(),
                    path.display(),
                    style("(not found, using defaults)").yellow()
                );
            }
        }
        println!();

        println!("{}", style("[engine]").cyan());
        println!("  rescue = {}", settings.engine.rescue);
        println!("  check_size = {}", settings.engine.check_size);
        println!("  check_free_space = {}", settings.engine.check_free_space);
        println!("  raw_block_size = {}", settings.engine.raw_block_size);
        println!();

        println!("{}", style("[progress]").cyan());
        println!("  style = \"{}\"", settings.progress.style);
        println!("  limit = {}", settings.progress.limit);
        println!();

        println!("{}", style("[behavior]").cyan());
        println!("  quiet = {}", settings.behavior.quiet);

        if !config_exists {
            println!();
            println!(
                "{}",
                style("Run 'partimg config --init' to create a configuration file.").dim()
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use partimg_core::{BehaviorSettings, EngineSettings, ProgressSettings};
    use tempfile::TempDir;

    /// Helper to create test settings with a custom path
    fn create_test_settings(dir: &TempDir) -> (Settings, PathBuf) {
        let config_path = dir.path().join("partimg_config.toml");
        let settings = Settings {
            engine: EngineSettings {
                rescue: true,
                check_size: true,
                check_free_space: false,
                raw_block_size: 8192,
            },
            progress: ProgressSettings {
                style: "plain".to_string(),
                limit: true,
            },
            behavior: BehaviorSettings { quiet: false },
        };
        (settings, config_path)
    }

    #[test]
    fn test_show_config_silent() {
        let result = show_config(None, false, true);
        assert!(result.is_ok());
    }

    #[test]
    fn test_show_config_json_silent() {
        let result = show_config(None, true, true);
        assert!(result.is_ok());
    }

    #[test]
    fn test_execute_path_flag() {
        let args = ConfigArgs {
            init: false,
            path: true,
            json: false,
            silent: true,
            config_file: None,
        };
        assert!(execute(args).is_ok());
    }

    #[test]
    fn test_init_creates_file_once() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("partimg_config.toml");

        init_config(Some(config_path.clone()), true).unwrap();
        assert!(config_path.exists());

        std::fs::write(&config_path, "[engine]\nrescue = true\n").unwrap();
        init_config(Some(config_path.clone()), true).unwrap();
        let contents = std::fs::read_to_string(&config_path).unwrap();
        assert_eq!(contents, "[engine]\nrescue = true\n");
    }

    #[test]
    fn test_init_without_path() {
        assert!(init_config(None, true).is_err());
    }

    #[test]
    fn test_settings_save_load_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let (settings, config_path) = create_test_settings(&temp_dir);

        settings.save_to_path(Some(config_path.clone())).unwrap();
        let loaded = Settings::load_from_path(Some(config_path));
        assert!(loaded.engine.rescue);
        assert_eq!(loaded.engine.raw_block_size, 8192);
        assert_eq!(loaded.progress.style, "plain");
        assert!(loaded.progress.limit);
    }

    #[test]
    fn test_settings_json_serialization() {
        let json = serde_json::to_string_pretty(&Settings::default()).unwrap();
        assert!(json.contains("raw_block_size"));
        assert!(json.contains("check_free_space"));
        assert!(json.contains("style"));
    }
}
