use once_cell::sync::Lazy;
use reqwest::Url;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

use super::table::{normalize_path, RouteTable};
use crate::auth::{RedirectResponse, SessionManager};

/// Upper bound on redirects followed by [`NavigationGuard::settle`]
const MAX_NAVIGATION_HOPS: usize = 8;

static BASE_URL: Lazy<Url> = Lazy::new(|| Url::parse("http://localhost/").unwrap());

/// Path plus optional query of a navigation target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub path: String,
    pub query: Option<String>,
}

impl Location {
    pub fn new(path: &str) -> Self {
        Self {
            path: normalize_path(path),
            query: None,
        }
    }

    /// Parse a target: a path, a path with query, or a full URL
    pub fn parse(target: &str) -> Option<Self> {
        let target = target.trim();
        if target.is_empty() {
            return None;
        }

        let url = BASE_URL.join(target).ok()?;
        if !matches!(url.scheme(), "http" | "https") {
            return None;
        }

        Some(Self {
            path: normalize_path(url.path()),
            query: url.query().filter(|q| !q.is_empty()).map(str::to_string),
        })
    }

    fn with_path(&self, path: String) -> Self {
        Self {
            path,
            query: self.query.clone(),
        }
    }

    fn to_url(&self) -> Url {
        let mut url = BASE_URL.clone();
        url.set_path(&self.path);
        url.set_query(self.query.as_deref());
        url
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.query {
            Some(ref query) => write!(f, "{}?{}", self.path, query),
            None => write!(f, "{}", self.path),
        }
    }
}

/// Outcome of one navigation attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Continue to the (possibly statically redirected) target
    Proceed(Location),
    /// Navigate somewhere else instead
    Redirect(Location),
}

impl Resolution {
    pub fn location(&self) -> &Location {
        match self {
            Resolution::Proceed(location) | Resolution::Redirect(location) => location,
        }
    }

    pub fn into_location(self) -> Location {
        match self {
            Resolution::Proceed(location) | Resolution::Redirect(location) => location,
        }
    }
}

/// Guard state as observed by views
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum GuardPhase {
    #[default]
    Idle,
    Evaluating(Location),
    Allowed(Location),
    Redirected(Location),
}

/// Navigation guard
/// Runs before every route transition and takes exactly one resolution
pub struct NavigationGuard {
    session: Arc<SessionManager>,
    routes: RouteTable,
    phase: watch::Sender<GuardPhase>,
}

impl NavigationGuard {
    pub fn new(session: Arc<SessionManager>, routes: RouteTable) -> Self {
        let (phase, _) = watch::channel(GuardPhase::Idle);
        Self {
            session,
            routes,
            phase,
        }
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Watch guard phases; a view may mount once `Allowed` is published
    pub fn subscribe(&self) -> watch::Receiver<GuardPhase> {
        self.phase.subscribe()
    }

    pub fn phase(&self) -> GuardPhase {
        self.phase.borrow().clone()
    }

    /// Evaluate one navigation attempt
    pub async fn navigate(&self, target: &str) -> Resolution {
        let Some(requested) = Location::parse(target) else {
            tracing::warn!("Unparsable navigation target '{}'", target);
            return self.publish(Resolution::Redirect(Location::new(self.routes.entry())));
        };

        let location = requested.with_path(self.routes.follow_redirects(&requested.path));
        self.phase.send_replace(GuardPhase::Evaluating(location.clone()));

        let resolution = self.evaluate(location).await;
        self.publish(resolution)
    }

    async fn evaluate(&self, location: Location) -> Resolution {
        if self.routes.is_completion(&location.path) {
            let response = RedirectResponse::from_url(&location.to_url());
            return match self.session.handle_login_redirect(&response).await {
                Ok(_) => Resolution::Redirect(Location::new(self.routes.home())),
                Err(e) => {
                    tracing::warn!("Login redirect could not be completed: {}", e);
                    Resolution::Redirect(Location::new(self.routes.entry()))
                }
            };
        }

        if self.routes.requires_auth(&location.path) && !self.session.is_authenticated().await {
            tracing::info!(
                "Navigation to {} requires authentication, redirecting to {}",
                location.path,
                self.routes.entry()
            );
            return Resolution::Redirect(Location::new(self.routes.entry()));
        }

        Resolution::Proceed(location)
    }

    fn publish(&self, resolution: Resolution) -> Resolution {
        let phase = match resolution {
            Resolution::Proceed(ref location) => GuardPhase::Allowed(location.clone()),
            Resolution::Redirect(ref location) => GuardPhase::Redirected(location.clone()),
        };
        tracing::debug!("Guard phase: {:?}", phase);
        self.phase.send_replace(phase);
        resolution
    }

    /// Navigate, following redirects as fresh navigations, and return where
    /// the user ends up
    pub async fn settle(&self, target: &str) -> Location {
        let mut resolution = self.navigate(target).await;

        for _ in 0..MAX_NAVIGATION_HOPS {
            match resolution {
                Resolution::Proceed(location) => return location,
                Resolution::Redirect(location) => {
                    resolution = self.navigate(&location.to_string()).await;
                }
            }
        }

        tracing::warn!("Navigation did not settle after {} redirects", MAX_NAVIGATION_HOPS);
        resolution.into_location()
    }
}
