use anyhow::{bail, Result};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;

use crate::types::LLMProvider;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub llm: LLMConfig,
    pub search: SearchConfig,
    pub agent: AgentConfig,
    pub settings_file: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub cors_allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    Sqlite,
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LLMConfig {
    pub openai_api_key: String,
    pub anthropic_api_key: String,
    pub openrouter_api_key: String,
    pub openrouter_base_url: String,
    pub default_provider: LLMProvider,
    pub default_model: Option<String>,
    pub planner_model: Option<String>,
    pub search_model: Option<String>,
    pub classifier_model: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    pub tavily_api_key: String,
    pub serpapi_key: String,
    pub max_results: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Hard cap on LLM round trips in the single-agent tool loop
    pub max_tool_iterations: usize,
    pub default_timezone: String,
    /// Number of prior messages loaded as conversation history
    pub history_limit: usize,
}

impl LLMConfig {
    pub fn api_key(&self, provider: LLMProvider) -> Option<String> {
        let key = match provider {
            LLMProvider::OpenAI => &self.openai_api_key,
            LLMProvider::Anthropic => &self.anthropic_api_key,
            LLMProvider::OpenRouter => &self.openrouter_api_key,
        };
        if key.is_empty() {
            None
        } else {
            Some(key.clone())
        }
    }

    pub fn model_for(&self, provider: LLMProvider) -> String {
        self.default_model
            .clone()
            .unwrap_or_else(|| provider.default_model().to_string())
    }
}

impl SearchConfig {
    pub fn has_tavily(&self) -> bool {
        !self.tavily_api_key.is_empty()
    }

    pub fn has_serpapi(&self) -> bool {
        !self.serpapi_key.is_empty()
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source
    pub fn from_vars<F>(var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let or = |key: &str, default: &str| var(key).unwrap_or_else(|| default.to_string());
        let opt = |key: &str| var(key).filter(|v| !v.trim().is_empty());

        let backend = match or("DATABASE_BACKEND", "sqlite").to_lowercase().as_str() {
            "sqlite" => DatabaseBackend::Sqlite,
            "postgres" | "postgresql" => DatabaseBackend::Postgres,
            other => bail!("Unsupported DATABASE_BACKEND: {}", other),
        };
        let default_url = match backend {
            DatabaseBackend::Sqlite => "sqlite://chat_history.db",
            DatabaseBackend::Postgres => "postgres://localhost/research_chat",
        };

        let provider_id = or("DEFAULT_PROVIDER", "openai");
        let default_provider = match LLMProvider::from_id(&provider_id) {
            Some(p) => p,
            None => bail!("Unsupported DEFAULT_PROVIDER: {}", provider_id),
        };

        let max_tool_iterations: usize = or("MAX_TOOL_ITERATIONS", "5").parse()?;
        if max_tool_iterations == 0 {
            bail!("MAX_TOOL_ITERATIONS must be at least 1");
        }

        let settings_file = opt("SETTINGS_FILE").map(PathBuf::from).unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("research-chat")
                .join("settings.json")
        });

        Ok(Self {
            server: ServerConfig {
                port: or("PORT", "8000").parse()?,
                host: or("HOST", "0.0.0.0"),
                cors_allowed_origins: or("ALLOWED_ORIGINS", "http://localhost:3000,http://localhost:5173")
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            },
            database: DatabaseConfig {
                backend,
                url: or("DATABASE_URL", default_url),
                max_connections: or("DB_MAX_CONNECTIONS", "10").parse()?,
                min_connections: or("DB_MIN_CONNECTIONS", "1").parse()?,
            },
            llm: LLMConfig {
                openai_api_key: or("OPENAI_API_KEY", ""),
                anthropic_api_key: or("ANTHROPIC_API_KEY", ""),
                openrouter_api_key: or("OPENROUTER_API_KEY", ""),
                openrouter_base_url: or("OPENROUTER_BASE_URL", "https://openrouter.ai/api/v1"),
                default_provider,
                default_model: opt("DEFAULT_MODEL"),
                planner_model: opt("PLANNER_MODEL"),
                search_model: opt("SEARCH_MODEL"),
                classifier_model: opt("CLASSIFIER_MODEL"),
            },
            search: SearchConfig {
                tavily_api_key: or("TAVILY_API_KEY", ""),
                serpapi_key: or("SERPAPI_API_KEY", ""),
                max_results: or("SEARCH_MAX_RESULTS", "5").parse()?,
            },
            agent: AgentConfig {
                max_tool_iterations,
                default_timezone: or("DEFAULT_TIMEZONE", "UTC"),
                history_limit: or("HISTORY_LIMIT", "20").parse()?,
            },
            settings_file,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_vars(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.database.backend, DatabaseBackend::Sqlite);
        assert_eq!(config.llm.default_provider, LLMProvider::OpenAI);
        assert_eq!(config.agent.max_tool_iterations, 5);
        assert_eq!(config.agent.default_timezone, "UTC");
        assert!(config.llm.api_key(LLMProvider::OpenAI).is_none());
        assert!(!config.search.has_tavily());
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("PORT", "9001"),
            ("DATABASE_BACKEND", "postgres"),
            ("DATABASE_URL", "postgres://db/chat"),
            ("DEFAULT_PROVIDER", "anthropic"),
            ("ANTHROPIC_API_KEY", "sk-ant"),
            ("TAVILY_API_KEY", "tvly"),
            ("ALLOWED_ORIGINS", "http://a, http://b"),
        ])
        .unwrap();
        assert_eq!(config.server.port, 9001);
        assert_eq!(config.database.backend, DatabaseBackend::Postgres);
        assert_eq!(config.llm.default_provider, LLMProvider::Anthropic);
        assert_eq!(config.llm.api_key(LLMProvider::Anthropic).as_deref(), Some("sk-ant"));
        assert_eq!(config.llm.model_for(LLMProvider::Anthropic), "claude-sonnet-4-20250514");
        assert!(config.search.has_tavily());
        assert_eq!(config.server.cors_allowed_origins, vec!["http://a", "http://b"]);
    }

    #[test]
    fn test_invalid_values() {
        assert!(config_from(&[("PORT", "not-a-port")]).is_err());
        assert!(config_from(&[("DEFAULT_PROVIDER", "google")]).is_err());
        assert!(config_from(&[("DATABASE_BACKEND", "mysql")]).is_err());
        assert!(config_from(&[("MAX_TOOL_ITERATIONS", "0")]).is_err());
    }
}
