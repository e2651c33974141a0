use serde::{Deserialize, Serialize};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

/// Connection settings for the backing Redis instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            db: 0,
        }
    }
}

impl RedisConfig {
    /// Build config from environment variables (call [`load_dotenv`] first).
    pub fn from_env() -> Self {
        Self {
            host: env_or("REDIS_HOST", "127.0.0.1"),
            port: env_or("REDIS_PORT", "6379").parse().unwrap_or(6379),
            password: env_opt("REDIS_PASSWORD"),
            db: env_or("REDIS_DB", "0").parse().unwrap_or(0),
        }
    }

    /// Connection URL in the form `redis://[:password@]host:port/db`.
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_url() {
        let cfg = RedisConfig::default();
        assert_eq!(cfg.url(), "redis://127.0.0.1:6379/0");
    }

    #[test]
    fn test_url_with_password() {
        let cfg = RedisConfig {
            host: "redis.internal".to_string(),
            port: 6380,
            password: Some("hunter2".to_string()),
            db: 9,
        };
        assert_eq!(cfg.url(), "redis://:hunter2@redis.internal:6380/9");
    }
}
