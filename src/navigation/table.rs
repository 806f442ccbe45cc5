// Declarative route table with per-route authorization requirements

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::RouteTableError;

static PARAM_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Upper bound on chained static redirects
const MAX_REDIRECT_HOPS: usize = 8;

/// One route as declared in the table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDef {
    /// Absolute at the top level, relative to the parent otherwise
    pub path: String,

    #[serde(default)]
    pub name: Option<String>,

    /// Static redirect target
    #[serde(default)]
    pub redirect: Option<String>,

    /// `None` inherits the parent's requirement
    #[serde(
        default,
        rename = "requireAuth",
        alias = "requireauth",
        alias = "require_auth"
    )]
    pub require_auth: Option<bool>,

    #[serde(default)]
    pub children: Vec<RouteDef>,
}

impl RouteDef {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            name: None,
            redirect: None,
            require_auth: None,
            children: Vec::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn redirect_to(mut self, target: impl Into<String>) -> Self {
        self.redirect = Some(target.into());
        self
    }

    pub fn require_auth(mut self, require_auth: bool) -> Self {
        self.require_auth = Some(require_auth);
        self
    }

    pub fn with_children(mut self, children: Vec<RouteDef>) -> Self {
        self.children = children;
        self
    }
}

/// Route file layout accepted by [`RouteTable::load`]
#[derive(Debug, Deserialize)]
struct RouteFile {
    entry: String,
    completion: String,
    home: String,
    routes: Vec<RouteDef>,
}

#[derive(Debug)]
struct CompiledRoute {
    pattern: String,
    regex: Regex,
    params: Vec<String>,
    name: Option<String>,
    redirect: Option<String>,
    require_auth: bool,
}

/// Result of matching a path against the table
#[derive(Debug, Clone, PartialEq)]
pub struct RouteMatch {
    pub name: Option<String>,
    pub pattern: String,
    pub params: HashMap<String, String>,
    pub require_auth: bool,
    pub redirect: Option<String>,
}

/// Immutable route table, validated at construction
#[derive(Debug)]
pub struct RouteTable {
    routes: Vec<CompiledRoute>,
    entry: String,
    completion: String,
    home: String,
}

impl RouteTable {
    /// Build a table from route definitions
    ///
    /// `entry` is the public entry route, `completion` the route the identity
    /// provider returns to, `home` where a completed sign-in lands.
    pub fn new(
        defs: Vec<RouteDef>,
        entry: impl Into<String>,
        completion: impl Into<String>,
        home: impl Into<String>,
    ) -> Result<Self, RouteTableError> {
        let mut routes = Vec::new();
        for def in &defs {
            if !def.path.starts_with('/') {
                return Err(RouteTableError::InvalidPattern {
                    pattern: def.path.clone(),
                    reason: "top-level routes must start with '/'".to_string(),
                });
            }
            compile(def, "", false, &mut routes)?;
        }

        let table = Self {
            routes,
            entry: normalize_path(&entry.into()),
            completion: normalize_path(&completion.into()),
            home: normalize_path(&home.into()),
        };
        table.validate()?;
        Ok(table)
    }

    /// Built-in table: public entry, redirect completion and the protected
    /// application area
    pub fn standard() -> Result<Self, RouteTableError> {
        let app_routes = vec![
            RouteDef::new("").named("app_home"),
            RouteDef::new("game/:gameId").with_children(vec![
                RouteDef::new("").named("game_home"),
                RouteDef::new("levels").named("game_levels"),
            ]),
        ];

        Self::new(
            vec![
                RouteDef::new("/")
                    .redirect_to("authenticate")
                    .require_auth(false),
                RouteDef::new("/authenticate")
                    .named("authenticate")
                    .require_auth(false),
                RouteDef::new("/login").named("login").require_auth(false),
                RouteDef::new("/app")
                    .require_auth(true)
                    .with_children(app_routes),
            ],
            "/authenticate",
            "/login",
            "/app",
        )
    }

    /// Load a table from a TOML, YAML or JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let file: RouteFile = ::config::Config::builder()
            .add_source(::config::File::from(path))
            .build()
            .with_context(|| format!("Failed to read route file: {}", path.display()))?
            .try_deserialize()
            .with_context(|| format!("Failed to parse route file: {}", path.display()))?;

        let table = Self::new(file.routes, file.entry, file.completion, file.home)
            .with_context(|| format!("Invalid route table in {}", path.display()))?;
        tracing::info!(
            "Loaded {} routes from {}",
            table.routes.len(),
            path.display()
        );
        Ok(table)
    }

    fn validate(&self) -> Result<(), RouteTableError> {
        for public in [&self.entry, &self.completion] {
            match self.resolve(public) {
                None => return Err(RouteTableError::MissingRoute(public.clone())),
                Some(m) if m.require_auth => {
                    return Err(RouteTableError::MustBePublic(public.clone()))
                }
                Some(_) => {}
            }
        }

        if self.resolve(&self.home).is_none() {
            return Err(RouteTableError::MissingRoute(self.home.clone()));
        }

        for route in self.routes.iter().filter(|r| r.redirect.is_some()) {
            let mut current = route.pattern.clone();
            let mut hops = 0;
            while let Some(target) = self.resolve(&current).and_then(|m| m.redirect) {
                if self.resolve(&target).is_none() {
                    return Err(RouteTableError::MissingRoute(target));
                }
                hops += 1;
                if hops > MAX_REDIRECT_HOPS {
                    return Err(RouteTableError::InvalidPattern {
                        pattern: route.pattern.clone(),
                        reason: "redirect chain does not terminate".to_string(),
                    });
                }
                current = target;
            }
        }

        Ok(())
    }

    /// Match a path (no query) against the table
    pub fn resolve(&self, path: &str) -> Option<RouteMatch> {
        let path = normalize_path(path);
        self.routes.iter().find_map(|route| {
            let caps = route.regex.captures(&path)?;
            let params = route
                .params
                .iter()
                .enumerate()
                .filter_map(|(i, name)| {
                    caps.get(i + 1)
                        .map(|m| (name.clone(), m.as_str().to_string()))
                })
                .collect();

            Some(RouteMatch {
                name: route.name.clone(),
                pattern: route.pattern.clone(),
                params,
                require_auth: route.require_auth,
                redirect: route.redirect.clone(),
            })
        })
    }

    /// Follow static redirects from `path`
    pub fn follow_redirects(&self, path: &str) -> String {
        let mut current = normalize_path(path);
        for _ in 0..MAX_REDIRECT_HOPS {
            match self.resolve(&current).and_then(|m| m.redirect) {
                Some(target) => {
                    tracing::debug!("Route {} redirects to {}", current, target);
                    current = target;
                }
                None => break,
            }
        }
        current
    }

    /// True when the path requires an authenticated session
    pub fn requires_auth(&self, path: &str) -> bool {
        self.resolve(path).map(|m| m.require_auth).unwrap_or(false)
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn completion(&self) -> &str {
        &self.completion
    }

    /// True when `path` is the redirect-completion route, in any letter case
    pub fn is_completion(&self, path: &str) -> bool {
        normalize_path(path).eq_ignore_ascii_case(&normalize_path(&self.completion))
    }

    pub fn home(&self) -> &str {
        &self.home
    }
}

/// Strip a trailing slash (except for the root) and ensure a leading one
pub(crate) fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

fn join_paths(parent: &str, child: &str) -> String {
    if child.starts_with('/') {
        normalize_path(child)
    } else if child.is_empty() {
        normalize_path(parent)
    } else {
        normalize_path(&format!("{}/{}", parent.trim_end_matches('/'), child))
    }
}

fn compile(
    def: &RouteDef,
    parent_path: &str,
    parent_requires_auth: bool,
    out: &mut Vec<CompiledRoute>,
) -> Result<(), RouteTableError> {
    let pattern = join_paths(parent_path, &def.path);

    if parent_requires_auth && def.require_auth == Some(false) {
        return Err(RouteTableError::PublicRouteInProtectedSubtree(pattern));
    }
    let require_auth = def.require_auth.unwrap_or(parent_requires_auth);

    // Children are matched first, so an empty-path child shadows its parent
    for child in &def.children {
        compile(child, &pattern, require_auth, out)?;
    }

    let (regex, params) = pattern_regex(&pattern)?;
    let redirect = def.redirect.as_deref().map(|target| {
        let parent = pattern.rsplit_once('/').map(|(p, _)| p).unwrap_or("");
        join_paths(parent, target)
    });

    out.push(CompiledRoute {
        pattern,
        regex,
        params,
        name: def.name.clone(),
        redirect,
        require_auth,
    });
    Ok(())
}

fn pattern_regex(pattern: &str) -> Result<(Regex, Vec<String>), RouteTableError> {
    let mut source = String::from("^");
    let mut params = Vec::new();

    for segment in pattern.split('/').filter(|s| !s.is_empty()) {
        source.push('/');
        match segment.strip_prefix(':') {
            Some(name) => {
                if !PARAM_NAME.is_match(name) {
                    return Err(RouteTableError::InvalidPattern {
                        pattern: pattern.to_string(),
                        reason: format!("invalid parameter name '{}'", name),
                    });
                }
                if params.iter().any(|p| p == name) {
                    return Err(RouteTableError::InvalidPattern {
                        pattern: pattern.to_string(),
                        reason: format!("duplicate parameter '{}'", name),
                    });
                }
                params.push(name.to_string());
                source.push_str("([^/]+)");
            }
            None => source.push_str(&regex::escape(segment)),
        }
    }

    if source == "^" {
        source.push('/');
    }
    source.push('$');

    // Paths match without regard to case, like the browser router
    let regex = RegexBuilder::new(&source)
        .case_insensitive(true)
        .build()
        .map_err(|e| RouteTableError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })?;
    Ok((regex, params))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_table() {
        let table = RouteTable::standard().unwrap();
        assert_eq!(table.entry(), "/authenticate");
        assert_eq!(table.completion(), "/login");
        assert_eq!(table.home(), "/app");

        let m = table.resolve("/app").unwrap();
        assert_eq!(m.name.as_deref(), Some("app_home"));
        assert!(m.require_auth);

        let m = table.resolve("/app/game/42/levels").unwrap();
        assert_eq!(m.name.as_deref(), Some("game_levels"));
        assert_eq!(m.params["gameId"], "42");
        assert!(m.require_auth);

        let m = table.resolve("/app/game/42/").unwrap();
        assert_eq!(m.name.as_deref(), Some("game_home"));

        assert!(!table.requires_auth("/authenticate"));
        assert!(!table.requires_auth("/login"));
    }

    #[test]
    fn test_root_redirects_to_entry() {
        let table = RouteTable::standard().unwrap();
        assert_eq!(
            table.resolve("/").unwrap().redirect.as_deref(),
            Some("/authenticate")
        );
        assert_eq!(table.follow_redirects("/"), "/authenticate");
        assert_eq!(table.follow_redirects("/app"), "/app");
    }

    #[test]
    fn test_unmatched_paths_are_public() {
        let table = RouteTable::standard().unwrap();
        assert!(table.resolve("/nowhere").is_none());
        assert!(!table.requires_auth("/nowhere"));
        assert!(table.resolve("/app/game").is_none());
    }

    #[test]
    fn test_matching_ignores_case() {
        let table = RouteTable::standard().unwrap();
        assert!(table.requires_auth("/APP"));
        assert!(table.requires_auth("/App/Game/7/LEVELS"));

        // Parameter values keep their case
        let m = table.resolve("/App/game/AbC").unwrap();
        assert_eq!(m.name.as_deref(), Some("game_home"));
        assert_eq!(m.params["gameId"], "AbC");

        assert!(table.is_completion("/LOGIN/"));
        assert!(!table.is_completion("/login/extra"));
    }

    #[test]
    fn test_public_route_inside_protected_subtree_is_rejected() {
        let err = RouteTable::new(
            vec![
                RouteDef::new("/authenticate").require_auth(false),
                RouteDef::new("/login").require_auth(false),
                RouteDef::new("/app")
                    .require_auth(true)
                    .with_children(vec![RouteDef::new("about").require_auth(false)]),
            ],
            "/authenticate",
            "/login",
            "/app",
        )
        .unwrap_err();
        assert_eq!(
            err,
            RouteTableError::PublicRouteInProtectedSubtree("/app/about".to_string())
        );
    }

    #[test]
    fn test_entry_must_be_public() {
        let err = RouteTable::new(
            vec![
                RouteDef::new("/authenticate").require_auth(true),
                RouteDef::new("/login"),
                RouteDef::new("/app").require_auth(true),
            ],
            "/authenticate",
            "/login",
            "/app",
        )
        .unwrap_err();
        assert_eq!(err, RouteTableError::MustBePublic("/authenticate".to_string()));
    }

    #[test]
    fn test_missing_routes_are_rejected() {
        let err = RouteTable::new(
            vec![RouteDef::new("/authenticate"), RouteDef::new("/app")],
            "/authenticate",
            "/login",
            "/app",
        )
        .unwrap_err();
        assert_eq!(err, RouteTableError::MissingRoute("/login".to_string()));

        let err = RouteTable::new(
            vec![
                RouteDef::new("/authenticate"),
                RouteDef::new("/login"),
                RouteDef::new("/old").redirect_to("/gone"),
            ],
            "/authenticate",
            "/login",
            "/login",
        )
        .unwrap_err();
        assert_eq!(err, RouteTableError::MissingRoute("/gone".to_string()));
    }

    #[test]
    fn test_redirect_loop_is_rejected() {
        let err = RouteTable::new(
            vec![
                RouteDef::new("/authenticate"),
                RouteDef::new("/login"),
                RouteDef::new("/a").redirect_to("/b"),
                RouteDef::new("/b").redirect_to("/a"),
            ],
            "/authenticate",
            "/login",
            "/authenticate",
        )
        .unwrap_err();
        assert!(matches!(err, RouteTableError::InvalidPattern { .. }));
    }

    #[test]
    fn test_invalid_patterns() {
        let err = RouteTable::new(
            vec![RouteDef::new("authenticate")],
            "/authenticate",
            "/login",
            "/app",
        )
        .unwrap_err();
        assert!(matches!(err, RouteTableError::InvalidPattern { .. }));

        let err = RouteTable::new(
            vec![RouteDef::new("/game/:id/:id")],
            "/authenticate",
            "/login",
            "/app",
        )
        .unwrap_err();
        assert!(matches!(err, RouteTableError::InvalidPattern { .. }));
    }

    #[test]
    fn test_load_route_file() {
        let dir = std::env::temp_dir().join(format!("session-gate-routes-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("routes.json");
        std::fs::write(
            &path,
            r#"{
                "entry": "/welcome",
                "completion": "/callback",
                "home": "/dashboard",
                "routes": [
                    {"path": "/welcome", "requireAuth": false},
                    {"path": "/callback", "requireAuth": false},
                    {"path": "/dashboard", "requireAuth": true, "children": [
                        {"path": "reports/:reportId", "name": "report"}
                    ]}
                ]
            }"#,
        )
        .unwrap();

        let table = RouteTable::load(&path).unwrap();
        assert_eq!(table.entry(), "/welcome");
        let m = table.resolve("/dashboard/reports/9").unwrap();
        assert_eq!(m.name.as_deref(), Some("report"));
        assert!(m.require_auth);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
