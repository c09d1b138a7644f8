use std::env;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};

/// Environment variable that overrides the default config directory.
pub const CONFIG_ENV_VAR: &str = "DOWNPOUR_CONFIG_PATH";

const DB_FILE: &str = "content.db";
const KEY_FILE: &str = ".secret_key";

/// Resolved filesystem locations for everything the tool persists.
pub struct Config {
    pub config_dir: PathBuf,
    pub db_path: PathBuf,
    pub key_path: PathBuf,
    pub default_download_dir: PathBuf,
}

impl Config {
    /// Resolves the config directory and makes sure it exists.
    pub fn load() -> Result<Self> {
        let config_dir = match env::var_os(CONFIG_ENV_VAR) {
            Some(path) => PathBuf::from(path),
            None => dirs::config_dir()
                .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
                .context("unable to determine config directory")?
                .join("downpour-dl"),
        };

        if !config_dir.is_dir() {
            fs::create_dir_all(&config_dir).with_context(|| {
                format!("unable to create config directory {}", config_dir.display())
            })?;
        }

        let db_path = config_dir.join(DB_FILE);
        let key_path = config_dir.join(KEY_FILE);
        let default_download_dir = dirs::home_dir()
            .context("unable to determine home directory")?
            .join("Audiobooks");

        Ok(Config {
            config_dir,
            db_path,
            key_path,
            default_download_dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_override_wins() {
        let dir = tempfile::tempdir().unwrap();
        let override_dir = dir.path().join("custom");
        env::set_var(CONFIG_ENV_VAR, &override_dir);
        let config = Config::load().unwrap();
        env::remove_var(CONFIG_ENV_VAR);

        assert_eq!(config.config_dir, override_dir);
        assert!(override_dir.is_dir());
        assert_eq!(config.db_path, override_dir.join("content.db"));
        assert_eq!(config.key_path, override_dir.join(".secret_key"));
    }
}
