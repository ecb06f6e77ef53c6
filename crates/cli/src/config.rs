use anyhow::{Context, Result};
use opsdesk_runtime_config::{
    AUTH_TOKEN_ENV, CONFIG_FILE_NAME, CONFIG_PATH_ENV, OpsdeskConfig, parse_config,
};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Get the config directory path (~/.config/opsdesk/)
pub fn config_dir() -> Result<PathBuf> {
    let home = home_dir().context("Could not determine home directory")?;
    Ok(home.join(".config").join("opsdesk"))
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .filter(|home| !home.is_empty())
        .map(PathBuf::from)
}

/// Config file to use: `--config`, else `$OPSDESK_CONFIG`, else the file in
/// the per-user config directory.
pub fn resolve_config_path(
    explicit: Option<&Path>,
    env_path: Option<OsString>,
    home: Option<PathBuf>,
) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Some(path) = env_path.filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(path));
    }
    home.map(|home| home.join(".config").join("opsdesk").join(CONFIG_FILE_NAME))
}

pub fn config_path(explicit: Option<&Path>) -> Result<PathBuf> {
    resolve_config_path(explicit, std::env::var_os(CONFIG_PATH_ENV), home_dir())
        .context("Could not determine config file location")
}

/// Read a config file; a missing file means all defaults.
pub fn load_config_file(path: &Path) -> Result<OpsdeskConfig> {
    if !path.exists() {
        return Ok(OpsdeskConfig::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config at {}", path.display()))?;
    parse_config(&content).with_context(|| format!("Failed to parse config at {}", path.display()))
}

/// Override `server.auth_token` from the environment when set.
pub fn apply_env_overrides(config: &mut OpsdeskConfig, token: Option<String>) -> bool {
    match token.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()) {
        Some(token) => {
            config.server.auth_token = token;
            true
        }
        None => false,
    }
}

/// Load the effective config: file (or defaults) plus environment overrides.
pub fn load_config(explicit: Option<&Path>) -> Result<OpsdeskConfig> {
    let path = config_path(explicit)?;
    let mut config = load_config_file(&path)?;
    apply_env_overrides(&mut config, std::env::var(AUTH_TOKEN_ENV).ok());
    Ok(config)
}

pub fn save_config_file(path: &Path, config: &OpsdeskConfig) -> Result<()> {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create config dir at {}", dir.display()))?;
    }
    let content = toml::to_string_pretty(config).context("Failed to serialize config")?;
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write config at {}", path.display()))?;
    Ok(())
}

fn mask(secret: &str) -> String {
    if secret.is_empty() {
        "(not set)".to_string()
    } else {
        let visible: String = secret.chars().take(8).collect();
        format!("{visible}...")
    }
}

/// Print current config.
pub fn show_config(explicit: Option<&Path>) -> Result<()> {
    let path = config_path(explicit)?;
    let config = load_config(explicit)?;
    println!("Config file: {}", path.display());
    if !path.exists() {
        println!("  (not found, using defaults)");
    }
    println!();
    println!("[server]");
    println!("  url        = {}", config.server.url);
    println!("  auth_token = {}", mask(&config.server.auth_token));
    println!();
    println!("[stream]");
    println!("  endpoint   = {}", config.stream.path);
    println!("  model      = {}", config.stream.model);
    println!("  max_turns  = {}", config.stream.max_turns);
    println!("  timeout    = {}s", config.stream.run_timeout_secs);
    println!();
    println!("[turns]");
    println!("  tolerance  = {}ms", config.turns.tolerance_ms);
    println!("  guard      = {}ms", config.turns.guard_ms);
    println!();
    println!("[clarifications]");
    println!("  enabled    = {}", config.clarifications.enabled);
    println!("  mode       = {:?}", config.clarifications.mode);
    println!(
        "  catalog    = {}",
        if config.clarifications.catalog_path.is_empty() {
            "(none)"
        } else {
            &config.clarifications.catalog_path
        }
    );
    Ok(())
}

/// Update config with provided values. Only the file's own values are
/// written; environment overrides are never persisted.
pub fn set_config(
    explicit: Option<&Path>,
    server_url: Option<String>,
    auth_token: Option<String>,
    model: Option<String>,
) -> Result<()> {
    let path = config_path(explicit)?;
    let mut config = load_config_file(&path)?;

    if let Some(url) = server_url {
        config.server.url = url;
    }
    if let Some(token) = auth_token {
        config.server.auth_token = token;
    }
    if let Some(model) = model {
        config.stream.model = model;
    }

    save_config_file(&path, &config)?;
    println!("Configuration updated.");
    show_config(explicit)?;
    Ok(())
}
