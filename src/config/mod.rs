use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;

const MIB: usize = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Lowercased `APP_ENV` value as given (defaults to "development")
    pub app_env: String,
    pub environment: Environment,
    pub filter: FilterConfig,
    pub api: ApiConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl Environment {
    /// Accepts the long and short spellings; anything else is development
    pub fn from_name(name: &str) -> Self {
        match name {
            "production" | "prod" => Self::Production,
            "staging" | "stage" => Self::Staging,
            _ => Self::Development,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Requested limits above this are capped
    pub max_limit: Option<u64>,
    pub max_nested_depth: usize,
    /// Default `eq` rendering for new where builders: `{f:{eq:v}}` instead of `{f:v}`
    pub strict_equality: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Adds the HTTP trace layer to the router
    pub enable_request_logging: bool,
    /// Cap for JSON and url-encoded bodies
    pub max_request_size_bytes: usize,
    /// Cap for multipart forms on endpoints without an upload config
    pub form_memory_limit_bytes: usize,
    pub upload_cleanup_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub jwt_secret: String,
    pub jwt_expiry_hours: u64,
    /// App-wide switch for `respond_and_log`
    pub enable_audit_logging: bool,
}

/// Replace `target` when `name` is set and parses; malformed values are logged and ignored
fn env_override<T: FromStr>(name: &str, target: &mut T) {
    let Ok(raw) = env::var(name) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *target = value,
        Err(_) => tracing::warn!("Ignoring {}={:?}: not a valid value", name, raw),
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let app_env = env::var("APP_ENV")
            .map(|v| v.trim().to_lowercase())
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "development".to_string());

        let mut config = Self::for_environment(Environment::from_name(&app_env));
        config.app_env = app_env;
        config.apply_env();
        config
    }

    pub fn for_environment(environment: Environment) -> Self {
        match environment {
            Environment::Development => Self::development(),
            Environment::Staging => Self::staging(),
            Environment::Production => Self::production(),
        }
    }

    fn apply_env(&mut self) {
        if let Ok(v) = env::var("FILTER_MAX_LIMIT") {
            // Empty or non-numeric removes the cap
            self.filter.max_limit = v.trim().parse().ok();
        }
        env_override("FILTER_MAX_NESTED_DEPTH", &mut self.filter.max_nested_depth);
        env_override("FILTER_STRICT_EQUALITY", &mut self.filter.strict_equality);

        env_override("API_ENABLE_REQUEST_LOGGING", &mut self.api.enable_request_logging);
        env_override("API_MAX_REQUEST_SIZE_BYTES", &mut self.api.max_request_size_bytes);
        env_override("API_FORM_MEMORY_LIMIT_BYTES", &mut self.api.form_memory_limit_bytes);
        env_override("API_UPLOAD_CLEANUP_DELAY_MS", &mut self.api.upload_cleanup_delay_ms);

        env_override("JWT_SECRET", &mut self.security.jwt_secret);
        env_override("SECURITY_JWT_EXPIRY_HOURS", &mut self.security.jwt_expiry_hours);
        env_override("SECURITY_ENABLE_AUDIT_LOGGING", &mut self.security.enable_audit_logging);
    }

    pub fn development() -> Self {
        Self {
            app_env: "development".to_string(),
            environment: Environment::Development,
            filter: FilterConfig {
                max_limit: Some(1000),
                max_nested_depth: 10,
                strict_equality: false,
            },
            api: ApiConfig {
                enable_request_logging: true,
                max_request_size_bytes: 10 * MIB,
                form_memory_limit_bytes: MIB,
                upload_cleanup_delay_ms: 500,
            },
            security: SecurityConfig {
                jwt_secret: String::new(),
                jwt_expiry_hours: 24 * 7,
                enable_audit_logging: true,
            },
        }
    }

    pub fn staging() -> Self {
        let mut config = Self::development();
        config.app_env = "staging".to_string();
        config.environment = Environment::Staging;
        config.filter.max_limit = Some(500);
        config.filter.max_nested_depth = 5;
        config.api.max_request_size_bytes = 5 * MIB;
        config.api.upload_cleanup_delay_ms = 1000;
        config.security.jwt_expiry_hours = 24;
        config
    }

    pub fn production() -> Self {
        let mut config = Self::staging();
        config.app_env = "production".to_string();
        config.environment = Environment::Production;
        config.filter.max_limit = Some(100);
        config.api.enable_request_logging = false;
        config.api.max_request_size_bytes = 2 * MIB;
        config.security.jwt_expiry_hours = 4;
        config
    }

    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::development()
    }
}

static CONFIG: Lazy<AppConfig> = Lazy::new(AppConfig::from_env);

/// Process-wide config, read from the environment on first use
pub fn config() -> &'static AppConfig {
    &CONFIG
}
