use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

use crate::llm::Provider;

pub struct Config {
    pub db_path: PathBuf,
    pub data_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub log_level: String,
    pub llm: LlmSettings,
}

#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub provider: Provider,
    /// Overrides the provider's default model.
    pub model: Option<String>,
    pub mistral_api_key: Option<String>,
    pub openrouter_api_key: Option<String>,
    pub ollama_host: String,
    pub ollama_port: u16,
}

impl LlmSettings {
    #[must_use]
    pub fn api_key(&self, provider: Provider) -> Option<&str> {
        match provider {
            Provider::Mistral => self.mistral_api_key.as_deref(),
            Provider::OpenRouter => self.openrouter_api_key.as_deref(),
            Provider::Ollama => None,
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Config {
    pub fn load() -> Result<Self> {
        let data_dir = match non_empty(std::env::var("MEALPLAN_DATA_DIR").ok()) {
            Some(dir) => PathBuf::from(dir),
            None => ProjectDirs::from("", "", "mealplan")
                .context("Could not determine home directory")?
                .data_dir()
                .to_path_buf(),
        };
        let config = Self::from_lookup(data_dir, |key| std::env::var(key).ok())?;

        std::fs::create_dir_all(&config.data_dir).with_context(|| {
            format!(
                "Failed to create data directory: {}",
                config.data_dir.display()
            )
        })?;
        Ok(config)
    }

    /// Build a config from `data_dir` and an environment lookup.
    pub fn from_lookup(data_dir: PathBuf, get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| non_empty(get(key));

        let provider = match var("MEALPLAN_LLM_PROVIDER") {
            Some(p) => p.parse()?,
            None => Provider::Mistral,
        };
        let ollama_port = match var("OLLAMA_PORT") {
            Some(p) => p
                .parse()
                .with_context(|| format!("Invalid OLLAMA_PORT '{p}'"))?,
            None => 11434,
        };

        Ok(Config {
            db_path: data_dir.join("mealplan.db"),
            backup_dir: data_dir.join("backups"),
            log_level: var("MEALPLAN_LOG").unwrap_or_else(|| "info".to_string()),
            llm: LlmSettings {
                provider,
                model: var("MEALPLAN_LLM_MODEL"),
                mistral_api_key: var("MISTRAL_API_KEY"),
                openrouter_api_key: var("OPENROUTER_API_KEY"),
                ollama_host: var("OLLAMA_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
                ollama_port,
            },
            data_dir,
        })
    }

    pub fn ensure_backup_dir(&self) -> Result<&Path> {
        std::fs::create_dir_all(&self.backup_dir).with_context(|| {
            format!(
                "Failed to create backup directory: {}",
                self.backup_dir.display()
            )
        })?;
        Ok(&self.backup_dir)
    }

    /// Load the API key from disk, or generate a new one.
    ///
    /// Returns `(key, newly_created)` where `newly_created` is true when a
    /// fresh key was just generated (first run).
    pub fn load_or_create_api_key(&self) -> Result<(String, bool)> {
        use rand::Rng;

        let path = self.data_dir.join("api_key");

        if path.exists() {
            let key = std::fs::read_to_string(&path).context("Failed to read API key file")?;
            let key = key.trim().to_string();
            if !key.is_empty() {
                return Ok((key, false));
            }
        }

        let bytes: [u8; 32] = rand::rng().random();
        let key = mealplan_core::digest::to_hex(&bytes);
        std::fs::write(&path, &key).context("Failed to write API key file")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .context("Failed to set API key file permissions")?;
        }
        Ok((key, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn config_with(vars: &[(&str, &str)]) -> Result<Config> {
        let env: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::from_lookup(PathBuf::from("/data"), |key| env.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_with(&[]).unwrap();
        assert_eq!(config.db_path, PathBuf::from("/data/mealplan.db"));
        assert_eq!(config.backup_dir, PathBuf::from("/data/backups"));
        assert_eq!(config.log_level, "info");
        assert_eq!(config.llm.provider, Provider::Mistral);
        assert!(config.llm.model.is_none());
        assert_eq!(config.llm.ollama_host, "127.0.0.1");
        assert_eq!(config.llm.ollama_port, 11434);
    }

    #[test]
    fn test_env_overrides() {
        let config = config_with(&[
            ("MEALPLAN_LLM_PROVIDER", "ollama"),
            ("MEALPLAN_LLM_MODEL", "llama3.1"),
            ("OLLAMA_PORT", "9000"),
            ("MISTRAL_API_KEY", "  "),
            ("OPENROUTER_API_KEY", "or-key"),
        ])
        .unwrap();
        assert_eq!(config.llm.provider, Provider::Ollama);
        assert_eq!(config.llm.model.as_deref(), Some("llama3.1"));
        assert_eq!(config.llm.ollama_port, 9000);
        assert!(config.llm.api_key(Provider::Mistral).is_none());
        assert_eq!(config.llm.api_key(Provider::OpenRouter), Some("or-key"));
    }

    #[test]
    fn test_invalid_values() {
        assert!(config_with(&[("MEALPLAN_LLM_PROVIDER", "skynet")]).is_err());
        assert!(config_with(&[("OLLAMA_PORT", "http")]).is_err());
    }

    #[test]
    fn test_api_key_created_once() {
        let dir = TempDir::new().unwrap();
        let config = Config::from_lookup(dir.path().to_path_buf(), |_| None).unwrap();

        let (key, created) = config.load_or_create_api_key().unwrap();
        assert!(created);
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));

        let (again, created) = config.load_or_create_api_key().unwrap();
        assert!(!created);
        assert_eq!(again, key);
    }
}
