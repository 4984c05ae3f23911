//! HTTP basic auth for the dialog viewer.

use anyhow::Context;
use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rc_context::{ForestFilter, RootId};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub name: String,
    pub password: String,
    /// Roots this user may browse, as `user/<id>` or `group/<id>`.
    #[serde(default)]
    pub allowed: Vec<String>,
    #[serde(default)]
    pub welcome: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub admins: Vec<User>,
    #[serde(default)]
    pub non_admins: Vec<User>,
}

/// The authenticated caller, attached to each request as an extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Viewer {
    pub name: String,
    pub is_admin: bool,
    pub allowed: HashSet<RootId>,
    pub welcome: String,
}

impl Viewer {
    pub fn may_view(&self, root: RootId) -> bool {
        self.is_admin || self.allowed.contains(&root)
    }

    pub fn forest_filter(&self) -> ForestFilter {
        if self.is_admin {
            ForestFilter::All
        } else {
            ForestFilter::Allowed(self.allowed.clone())
        }
    }
}

impl AuthConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
        let cfg: AuthConfig =
            serde_json::from_slice(&raw).with_context(|| format!("parse {}", path.display()))?;
        if cfg.admins.is_empty() && cfg.non_admins.is_empty() {
            tracing::warn!(path = %path.display(), "viewer auth file lists no users");
        }
        Ok(cfg)
    }

    pub fn authenticate(&self, name: &str, password: &str) -> Option<Viewer> {
        let matches = |u: &&User| u.name == name && u.password == password;
        if let Some(user) = self.admins.iter().find(matches) {
            return Some(Self::viewer(user, true));
        }
        self.non_admins
            .iter()
            .find(matches)
            .map(|user| Self::viewer(user, false))
    }

    fn viewer(user: &User, is_admin: bool) -> Viewer {
        let allowed = user
            .allowed
            .iter()
            .filter_map(|raw| match raw.trim().parse::<RootId>() {
                Ok(root) => Some(root),
                Err(e) => {
                    tracing::warn!(user = %user.name, entry = %raw, error = %e, "ignoring allowed entry");
                    None
                }
            })
            .collect();
        Viewer {
            name: user.name.clone(),
            is_admin,
            allowed,
            welcome: user.welcome.clone(),
        }
    }
}

fn parse_basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let raw = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, payload) = raw.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(payload.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (name, password) = decoded.split_once(':')?;
    Some((name.to_string(), password.to_string()))
}

fn ask_for_credentials() -> Response {
    let mut response = (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "status": "error", "error": "unauthorized" })),
    )
        .into_response();
    response.headers_mut().insert(
        WWW_AUTHENTICATE,
        HeaderValue::from_static(r#"Basic realm="Restricted""#),
    );
    response
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn require_basic_auth(
    State(auth): State<Arc<AuthConfig>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let Some((name, password)) = parse_basic_credentials(req.headers()) else {
        return ask_for_credentials();
    };
    let Some(viewer) = auth.authenticate(&name, &password) else {
        tracing::warn!(user = %name, "viewer login rejected");
        return ask_for_credentials();
    };
    req.extensions_mut().insert(viewer);
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basic(name: &str, password: &str) -> String {
        format!("Basic {}", STANDARD.encode(format!("{name}:{password}")))
    }

    fn auth() -> AuthConfig {
        serde_json::from_str(
            r#"{
                "admins": [{ "name": "root", "password": "pw" }],
                "non_admins": [{
                    "name": "guest",
                    "password": "guest:pw",
                    "allowed": ["user/1", "group/2", "nonsense"],
                    "welcome": "hi guest"
                }]
            }"#,
        )
        .expect("auth")
    }

    #[test]
    fn parses_basic_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&basic("guest", "guest:pw")).expect("header"),
        );
        assert_eq!(
            parse_basic_credentials(&headers),
            Some(("guest".to_string(), "guest:pw".to_string()))
        );

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(parse_basic_credentials(&headers), None);
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic !!!"));
        assert_eq!(parse_basic_credentials(&headers), None);
    }

    #[test]
    fn admins_see_everything() {
        let viewer = auth().authenticate("root", "pw").expect("admin");
        assert!(viewer.is_admin);
        assert!(viewer.may_view(RootId::group(99)));
        assert_eq!(viewer.forest_filter(), ForestFilter::All);
    }

    #[test]
    fn non_admins_are_scoped() {
        let viewer = auth().authenticate("guest", "guest:pw").expect("guest");
        assert!(!viewer.is_admin);
        assert_eq!(viewer.welcome, "hi guest");
        assert_eq!(
            viewer.allowed,
            HashSet::from([RootId::user(1), RootId::group(2)])
        );
        assert!(viewer.may_view(RootId::user(1)));
        assert!(!viewer.may_view(RootId::group(1)));
    }

    #[test]
    fn wrong_password_is_rejected() {
        assert!(auth().authenticate("root", "nope").is_none());
        assert!(auth().authenticate("ghost", "pw").is_none());
    }
}
