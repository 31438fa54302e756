//! Configuration file management for foreman.
//!
//! Provides a TOML-based config file at `~/.config/foreman/config.toml` and
//! a resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use foreman_core::sandbox::SandboxConfig;
use foreman_core::token::TokenConfig;
use foreman_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    pub auth: AuthSection,
    #[serde(default)]
    pub sandbox: SandboxSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthSection {
    /// Hex-encoded token secret (64 hex chars = 32 bytes).
    pub token_secret: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SandboxSection {
    /// Container image for worker processes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the foreman config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/foreman` or
/// `~/.config/foreman`. We intentionally ignore the platform-specific
/// `dirs::config_dir()` (which returns `~/Library/Application Support` on
/// macOS).
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("foreman");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("foreman")
}

/// Return the path to the foreman config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    // Set permissions to 0600 (owner read/write only) on Unix.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Token secret generation
// -----------------------------------------------------------------------

/// Generate a random token secret: 32 random bytes, hex-encoded (64 chars).
pub fn generate_token_secret() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct ForemanConfig {
    pub db_config: DbConfig,
    pub token_config: TokenConfig,
    pub sandbox_config: SandboxConfig,
}

impl ForemanConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > default.
    ///
    /// - DB URL: `cli_db_url` > `FOREMAN_DATABASE_URL` env >
    ///   `config_file.database.url` > `DbConfig::DEFAULT_URL`
    /// - Token secret: `FOREMAN_TOKEN_SECRET` env >
    ///   `config_file.auth.token_secret` (hex-decoded) > error
    /// - Worker image: `FOREMAN_WORKER_IMAGE` env >
    ///   `config_file.sandbox.image` > built-in default
    /// - Worker credential: `FOREMAN_WORKER_API_KEY` env, passed through to
    ///   spawned workers when set
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let file_config = load_config().ok();

        // DB URL resolution.
        let db_url = if let Some(url) = cli_db_url {
            url.to_string()
        } else if let Ok(url) = std::env::var("FOREMAN_DATABASE_URL") {
            url
        } else if let Some(ref cfg) = file_config {
            cfg.database.url.clone()
        } else {
            DbConfig::DEFAULT_URL.to_string()
        };
        let db_config = DbConfig::new(db_url);

        // Token secret resolution.
        let token_config = if let Ok(secret_hex) = std::env::var("FOREMAN_TOKEN_SECRET") {
            let secret = hex::decode(&secret_hex)
                .context("FOREMAN_TOKEN_SECRET is not valid hex")?;
            TokenConfig::new(secret)
        } else if let Some(ref cfg) = file_config {
            let secret = hex::decode(&cfg.auth.token_secret)
                .context("auth.token_secret in the config file is not valid hex")?;
            TokenConfig::new(secret)
        } else {
            bail!(
                "no token secret configured; run `foreman init` or set FOREMAN_TOKEN_SECRET"
            );
        };

        // Sandbox resolution.
        let mut sandbox_config = SandboxConfig::default();
        if let Ok(image) = std::env::var("FOREMAN_WORKER_IMAGE") {
            sandbox_config.image = image;
        } else if let Some(image) = file_config.as_ref().and_then(|c| c.sandbox.image.clone()) {
            sandbox_config.image = image;
        }
        if let Ok(credential) = std::env::var("FOREMAN_WORKER_API_KEY") {
            sandbox_config.credential = Some(credential);
        }

        Ok(Self {
            db_config,
            token_config,
            sandbox_config,
        })
    }
}
