use anyhow::{Context, Result};
use reqwest::Url;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use session_gate::auth::{LogNavigator, OidcClient, SessionManager, SqliteStore};
use session_gate::callback::{self, CallbackListener};
use session_gate::config::{self, Command, Config, HttpMethod};
use session_gate::http_client::ApiClient;
use session_gate::navigation::{NavigationGuard, RouteTable};

#[tokio::main]
async fn main() -> Result<()> {
    // Check if interactive setup is needed (no .env and missing required values)
    if config::needs_interactive_setup() {
        let interactive_config = config::run_interactive_setup()?;

        // Export so Config::load() can use them
        interactive_config.export();
    }

    // Load configuration first (for log level)
    let config = Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("session-gate {} starting...", env!("CARGO_PKG_VERSION"));
    tracing::debug!("Identity provider: {}", config.auth_url);
    tracing::debug!("Backend: {}", config.api_url);

    // Persisted session state
    let store = Arc::new(SqliteStore::open(&config.session_db_file)?);

    let provider = Arc::new(OidcClient::new(
        config.oidc_settings(),
        store,
        config.http_request_timeout.map(Duration::from_secs),
    )?);

    let session = Arc::new(SessionManager::new(
        provider,
        Arc::new(LogNavigator),
        config.session_settings(),
    ));

    let routes = match config.routes_file {
        Some(ref path) => RouteTable::load(path)?,
        None => RouteTable::standard()?,
    };
    let guard = Arc::new(NavigationGuard::new(session.clone(), routes));

    let api = ApiClient::new(
        config.api_url.clone(),
        session.clone(),
        config.http_request_timeout,
        config.http_connect_timeout,
    )?;

    match config.command.clone() {
        Command::Login => run_login(&config, &session, guard).await,
        Command::Logout => {
            session.logout().await?;
            println!("Signed out");
            Ok(())
        }
        Command::Status => print_status(&session).await,
        Command::Navigate { path } => {
            let location = guard.settle(&path).await;
            println!("{}", location);
            Ok(())
        }
        Command::Request { method, path, body } => {
            run_request(&api, method, &path, body.as_deref()).await
        }
    }
}

/// Start the sign-in redirect and serve the redirect URI until it returns
async fn run_login(
    config: &Config,
    session: &SessionManager,
    guard: Arc<NavigationGuard>,
) -> Result<()> {
    let redirect_uri = Url::parse(&config.auth_redirect_url)?;
    let addr = callback::listen_addr(&redirect_uri)?;

    // Listen before handing control to the provider so the return is not missed
    let mut listener = CallbackListener::bind(guard, &addr).await?;
    session.login().await?;

    let location = tokio::select! {
        result = listener.wait() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C signal, cancelling sign-in...");
            anyhow::bail!("Sign-in cancelled");
        }
    };

    match session.session().await {
        Some(current) => {
            println!("Signed in, now at {}", location);
            if let Some(subject) = current.profile.get("sub").and_then(|v| v.as_str()) {
                println!("  Subject:  {}", subject);
            }
            println!("  Expires:  {}", current.expires_at.to_rfc3339());
            Ok(())
        }
        None => anyhow::bail!("Sign-in failed, navigation resolved to {}", location),
    }
}

async fn print_status(session: &SessionManager) -> Result<()> {
    let Some(current) = session.session().await else {
        println!("Not authenticated");
        return Ok(());
    };

    println!("Authenticated");
    println!("  Token:    {}...", token_prefix(&current.access_token));
    println!("  Expires:  {}", current.expires_at.to_rfc3339());
    println!(
        "  Profile:  {}",
        serde_json::to_string_pretty(&current.profile)?
    );
    Ok(())
}

/// First characters of a credential, safe to print
fn token_prefix(token: &str) -> String {
    token.chars().take(8).collect()
}

async fn run_request(
    api: &ApiClient,
    method: HttpMethod,
    path: &str,
    body: Option<&str>,
) -> Result<()> {
    let body: Value = body
        .map(serde_json::from_str::<Value>)
        .transpose()
        .context("--body is not valid JSON")?
        .unwrap_or_else(|| Value::Object(Default::default()));

    let result = match method {
        HttpMethod::Get => api.get::<Value>(path).await.map(Some),
        HttpMethod::Post => api.post::<Value, _>(path, &body).await.map(Some),
        HttpMethod::Put => api.put::<Value, _>(path, &body).await.map(Some),
        HttpMethod::Delete => api.delete(path).await.map(|()| None),
    };

    match result {
        Ok(Some(envelope)) => {
            println!("{}", serde_json::to_string_pretty(&envelope)?);
            Ok(())
        }
        Ok(None) => {
            println!("Deleted {}", path);
            Ok(())
        }
        Err(e) if e.is_unauthorized() => {
            anyhow::bail!("Unauthorized: {} (session ended, run `session-gate login`)", e)
        }
        Err(e) => Err(e).with_context(|| format!("{:?} {} failed", method, path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_prefix() {
        assert_eq!(token_prefix("abcdefghijkl"), "abcdefgh");
        assert_eq!(token_prefix("abc"), "abc");
        assert_eq!(token_prefix("ééééééééé"), "éééééééé");
    }
}
