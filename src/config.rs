use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use dialoguer::{Confirm, Input};
use reqwest::Url;
use std::io::Write;
use std::path::PathBuf;

use crate::auth::{OidcSettings, SessionSettings};

/// session-gate - OIDC session, authorized requests and route guarding
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Backend API base URL
    #[arg(long, env = "API_URL")]
    pub api_url: Option<String>,

    /// Identity provider authority URL
    #[arg(long, env = "AUTH_URL")]
    pub auth_url: Option<String>,

    /// OAuth client id registered with the identity provider
    #[arg(long, env = "AUTH_CLIENT_ID")]
    pub client_id: Option<String>,

    /// Redirect URI the identity provider returns to
    #[arg(long, env = "AUTH_REDIRECT_URL")]
    pub redirect_url: Option<String>,

    /// Where the identity provider sends the browser after sign-out
    #[arg(long, env = "AUTH_POST_LOGOUT_REDIRECT_URL")]
    pub post_logout_redirect_url: Option<String>,

    /// Requested scopes
    #[arg(long, env = "AUTH_SCOPE", default_value = "openid profile email")]
    pub scope: String,

    /// Path to the session SQLite database
    #[arg(short = 'd', long, env = "SESSION_DB_FILE")]
    pub db_file: Option<String>,

    /// Route table file (TOML, YAML or JSON); built-in table when unset
    #[arg(long, env = "ROUTES_FILE")]
    pub routes_file: Option<String>,

    /// Renew the token once it expires within this many seconds
    #[arg(long, env = "TOKEN_RENEW_THRESHOLD", default_value = "60")]
    pub renew_threshold: u64,

    /// Seconds between renewal checks
    #[arg(long, env = "TOKEN_RENEW_INTERVAL", default_value = "15")]
    pub renew_interval: u64,

    /// Renew the token in the background
    #[arg(long, env = "AUTOMATIC_SILENT_RENEW", default_value = "true", action = clap::ArgAction::Set)]
    pub silent_renew: bool,

    /// HTTP request timeout in seconds (unbounded when unset)
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT")]
    pub http_timeout: Option<u64>,

    /// HTTP connect timeout in seconds (unbounded when unset)
    #[arg(long, env = "HTTP_CONNECT_TIMEOUT")]
    pub http_connect_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Sign in through the identity provider
    Login,

    /// End the session and sign out at the identity provider
    Logout,

    /// Show authentication state and profile
    Status,

    /// Run the navigation guard for a path and print where it lands
    Navigate {
        /// Target path, optionally with a query
        path: String,
    },

    /// Send an authorized request to the backend
    Request {
        #[arg(value_enum)]
        method: HttpMethod,

        /// Path relative to the API base URL
        path: String,

        /// JSON request body
        #[arg(long)]
        body: Option<String>,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

#[derive(Clone, Debug)]
pub struct Config {
    // Backend
    pub api_url: String,

    // Identity provider
    pub auth_url: String,
    pub auth_client_id: String,
    pub auth_redirect_url: String,
    pub auth_post_logout_redirect_url: Option<String>,
    pub auth_scope: String,

    // Session
    pub session_db_file: PathBuf,
    pub token_renew_threshold: u64,
    pub token_renew_interval: u64,
    pub automatic_silent_renew: bool,

    // Navigation
    pub routes_file: Option<PathBuf>,

    // HTTP client
    pub http_request_timeout: Option<u64>,
    pub http_connect_timeout: Option<u64>,

    // Logging
    pub log_level: String,

    pub command: Command,
}

impl Config {
    /// Load configuration with priority: CLI > ENV > defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(args: CliArgs) -> Result<Self> {
        let config = Config {
            api_url: args
                .api_url
                .context("API_URL is required (use --api-url or set API_URL env var)")?,

            auth_url: args
                .auth_url
                .context("AUTH_URL is required (use --auth-url or set AUTH_URL env var)")?,

            auth_client_id: args.client_id.context(
                "AUTH_CLIENT_ID is required (use --client-id or set AUTH_CLIENT_ID env var)",
            )?,

            auth_redirect_url: args.redirect_url.context(
                "AUTH_REDIRECT_URL is required (use --redirect-url or set AUTH_REDIRECT_URL env var)",
            )?,

            auth_post_logout_redirect_url: args.post_logout_redirect_url,
            auth_scope: args.scope,

            session_db_file: args
                .db_file
                .map(|s| expand_tilde(&s))
                .unwrap_or_else(default_db_path),

            token_renew_threshold: args.renew_threshold,
            token_renew_interval: args.renew_interval,
            automatic_silent_renew: args.silent_renew,

            routes_file: args.routes_file.map(|s| expand_tilde(&s)),

            http_request_timeout: args.http_timeout,
            http_connect_timeout: args.http_connect_timeout,

            log_level: args.log_level,

            command: args.command,
        };

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("API_URL", &self.api_url),
            ("AUTH_URL", &self.auth_url),
            ("AUTH_REDIRECT_URL", &self.auth_redirect_url),
        ] {
            Url::parse(value).with_context(|| format!("{} is not a valid URL: {}", name, value))?;
        }

        let redirect = Url::parse(&self.auth_redirect_url)?;
        if !matches!(redirect.scheme(), "http" | "https") || redirect.host_str().is_none() {
            anyhow::bail!(
                "AUTH_REDIRECT_URL must be an absolute http(s) URL: {}",
                self.auth_redirect_url
            );
        }

        if let Some(ref url) = self.auth_post_logout_redirect_url {
            Url::parse(url).with_context(|| {
                format!("AUTH_POST_LOGOUT_REDIRECT_URL is not a valid URL: {}", url)
            })?;
        }

        if self.auth_client_id.trim().is_empty() {
            anyhow::bail!("AUTH_CLIENT_ID cannot be empty");
        }

        if self.token_renew_interval == 0 {
            anyhow::bail!("TOKEN_RENEW_INTERVAL must be at least 1 second");
        }

        if let Some(ref routes_file) = self.routes_file {
            if !routes_file.exists() {
                anyhow::bail!("ROUTES_FILE does not exist: {}", routes_file.display());
            }
        }

        Ok(())
    }

    pub fn oidc_settings(&self) -> OidcSettings {
        let mut settings = OidcSettings::new(
            self.auth_url.clone(),
            self.auth_client_id.clone(),
            self.auth_redirect_url.clone(),
        );
        settings.post_logout_redirect_uri = self.auth_post_logout_redirect_url.clone();
        settings.scope = self.auth_scope.clone();
        settings
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            renew_threshold: chrono::Duration::seconds(self.token_renew_threshold as i64),
            check_interval: std::time::Duration::from_secs(self.token_renew_interval),
            automatic_silent_renew: self.automatic_silent_renew,
        }
    }
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Session database location when SESSION_DB_FILE is unset
fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("session-gate")
        .join("session.sqlite3")
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUIRED: [&str; 9] = [
        "session-gate",
        "--api-url",
        "http://localhost:3000/api",
        "--auth-url",
        "http://localhost:8080/realms/game",
        "--client-id",
        "game-spa",
        "--redirect-url",
        "http://localhost:5173/login",
    ];

    fn parse(extra: &[&str]) -> Result<Config> {
        let args: Vec<&str> = REQUIRED.iter().chain(extra.iter()).copied().collect();
        Config::from_args(CliArgs::try_parse_from(args)?)
    }

    #[test]
    fn test_expand_tilde() {
        let path = expand_tilde("~/test/file.txt");
        assert!(path.to_string_lossy().contains("test/file.txt"));
        assert!(!path.to_string_lossy().starts_with("~"));

        let path = expand_tilde("/absolute/path");
        assert_eq!(path, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_expand_tilde_just_tilde() {
        // Just "~" without slash should not expand
        let path = expand_tilde("~");
        assert_eq!(path, PathBuf::from("~"));
    }

    #[test]
    fn test_defaults() {
        let config = parse(&["status"]).unwrap();
        assert_eq!(config.command, Command::Status);
        assert_eq!(config.auth_scope, "openid profile email");
        assert_eq!(config.token_renew_threshold, 60);
        assert_eq!(config.token_renew_interval, 15);
        assert!(config.automatic_silent_renew);
        assert!(config.http_request_timeout.is_none());
        assert!(config.session_db_file.ends_with("session-gate/session.sqlite3"));
        config.validate().unwrap();
    }

    #[test]
    fn test_request_subcommand() {
        let config = parse(&["request", "post", "scores", "--body", r#"{"score":10}"#]).unwrap();
        assert_eq!(
            config.command,
            Command::Request {
                method: HttpMethod::Post,
                path: "scores".to_string(),
                body: Some(r#"{"score":10}"#.to_string()),
            }
        );
    }

    #[test]
    fn test_silent_renew_can_be_disabled() {
        let config = parse(&["--silent-renew", "false", "status"]).unwrap();
        assert!(!config.automatic_silent_renew);
        assert!(!config.session_settings().automatic_silent_renew);
    }

    #[test]
    fn test_settings_conversion() {
        let config = parse(&[
            "--post-logout-redirect-url",
            "http://localhost:5173/authenticate",
            "--renew-threshold",
            "120",
            "logout",
        ])
        .unwrap();

        let oidc = config.oidc_settings();
        assert_eq!(oidc.client_id, "game-spa");
        assert_eq!(oidc.response_type, "code");
        assert_eq!(
            oidc.post_logout_redirect_uri.as_deref(),
            Some("http://localhost:5173/authenticate")
        );

        let session = config.session_settings();
        assert_eq!(session.renew_threshold, chrono::Duration::seconds(120));
        assert_eq!(session.check_interval, std::time::Duration::from_secs(15));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = parse(&["status"]).unwrap();
        config.api_url = "not a url".to_string();
        assert!(config.validate().is_err());

        let mut config = parse(&["status"]).unwrap();
        config.token_renew_interval = 0;
        assert!(config.validate().is_err());

        let mut config = parse(&["status"]).unwrap();
        config.routes_file = Some(PathBuf::from("/nonexistent/routes.toml"));
        assert!(config.validate().is_err());

        let mut config = parse(&["status"]).unwrap();
        config.auth_redirect_url = "myapp:callback".to_string();
        assert!(config.validate().is_err());
    }
}

// === Interactive Setup ===

/// Check if interactive setup is needed (no .env file and missing required values)
pub fn needs_interactive_setup() -> bool {
    let env_file_exists = std::path::Path::new(".env").exists();

    let missing_required = ["API_URL", "AUTH_URL", "AUTH_CLIENT_ID", "AUTH_REDIRECT_URL"]
        .iter()
        .any(|key| std::env::var(key).is_err());

    !env_file_exists && missing_required
}

/// Run interactive setup to collect required configuration
pub fn run_interactive_setup() -> Result<InteractiveConfig> {
    println!();
    println!("session-gate - first time setup");
    println!();
    println!("No configuration found. Let's connect to your backend and identity provider.");
    println!();

    let api_url: String = Input::new()
        .with_prompt("Backend API base URL (API_URL)")
        .default("http://localhost:3000/api".to_string())
        .interact_text()
        .context("Failed to read API_URL")?;

    let auth_url: String = Input::new()
        .with_prompt("Identity provider authority URL (AUTH_URL)")
        .interact_text()
        .context("Failed to read AUTH_URL")?;

    let auth_client_id: String = Input::new()
        .with_prompt("OAuth client id (AUTH_CLIENT_ID)")
        .interact_text()
        .context("Failed to read AUTH_CLIENT_ID")?;

    if auth_client_id.trim().is_empty() {
        anyhow::bail!("AUTH_CLIENT_ID cannot be empty");
    }

    let auth_redirect_url: String = Input::new()
        .with_prompt("Redirect URI (AUTH_REDIRECT_URL)")
        .default("http://localhost:5173/login".to_string())
        .interact_text()
        .context("Failed to read AUTH_REDIRECT_URL")?;

    for (name, value) in [
        ("API_URL", &api_url),
        ("AUTH_URL", &auth_url),
        ("AUTH_REDIRECT_URL", &auth_redirect_url),
    ] {
        Url::parse(value).with_context(|| format!("{} is not a valid URL: {}", name, value))?;
    }

    let config = InteractiveConfig {
        api_url,
        auth_url,
        auth_client_id,
        auth_redirect_url,
    };

    println!();
    let save_to_env = Confirm::new()
        .with_prompt("Save configuration to .env file?")
        .default(true)
        .interact()
        .context("Failed to read save confirmation")?;

    if save_to_env {
        save_env_file(&config)?;
        println!();
        println!("Configuration saved to .env file");
    }

    println!();
    Ok(config)
}

/// Configuration collected from interactive setup
#[derive(Debug, Clone)]
pub struct InteractiveConfig {
    pub api_url: String,
    pub auth_url: String,
    pub auth_client_id: String,
    pub auth_redirect_url: String,
}

impl InteractiveConfig {
    /// Export as environment variables so `Config::load()` picks them up
    pub fn export(&self) {
        std::env::set_var("API_URL", &self.api_url);
        std::env::set_var("AUTH_URL", &self.auth_url);
        std::env::set_var("AUTH_CLIENT_ID", &self.auth_client_id);
        std::env::set_var("AUTH_REDIRECT_URL", &self.auth_redirect_url);
    }
}

/// Save configuration to .env file
fn save_env_file(config: &InteractiveConfig) -> Result<()> {
    let env_content = format!(
        r#"# session-gate configuration
# Generated by interactive setup

# Backend API base URL (required)
API_URL={}

# Identity provider (required)
AUTH_URL={}
AUTH_CLIENT_ID={}
AUTH_REDIRECT_URL={}

# Silent renewal
TOKEN_RENEW_THRESHOLD=60
TOKEN_RENEW_INTERVAL=15
AUTOMATIC_SILENT_RENEW=true

# Logging (trace, debug, info, warn, error)
LOG_LEVEL=info
"#,
        config.api_url, config.auth_url, config.auth_client_id, config.auth_redirect_url,
    );

    let mut file = std::fs::File::create(".env").context("Failed to create .env file")?;
    file.write_all(env_content.as_bytes())
        .context("Failed to write .env file")?;

    Ok(())
}
