//! Credential resolution for the HTTP surface.
//!
//! Callers authenticate with a bearer header, an `api_key` query
//! parameter (the realtime endpoint), or a session cookie. A credential
//! resolves to the owning tenant; everything downstream filters by it.

use std::collections::HashMap;

use axum::http::HeaderMap;
use axum::http::header::{AUTHORIZATION, COOKIE};

use crate::config::ApiKeyEntry;

const SESSION_COOKIE: &str = "ocrbase_session";

/// Who a request acts as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub tenant_id: String,
    pub submitter_id: String,
}

#[derive(Debug, Default)]
pub struct ApiKeyAuth {
    keys: HashMap<String, AuthContext>,
}

impl ApiKeyAuth {
    pub fn new(entries: &[ApiKeyEntry]) -> Self {
        let keys = entries
            .iter()
            .map(|entry| {
                (
                    entry.key.clone(),
                    AuthContext {
                        tenant_id: entry.tenant_id.clone(),
                        submitter_id: entry.submitter_id.clone(),
                    },
                )
            })
            .collect();
        Self { keys }
    }

    pub fn resolve_key(&self, key: &str) -> Option<AuthContext> {
        self.keys.get(key).cloned()
    }

    /// Resolve a request's credential: bearer header, then explicit query
    /// key, then session cookie.
    pub fn authenticate(
        &self,
        headers: &HeaderMap,
        query_api_key: Option<&str>,
    ) -> Option<AuthContext> {
        if let Some(key) = bearer_token(headers) {
            return self.resolve_key(key);
        }
        if let Some(key) = query_api_key {
            return self.resolve_key(key);
        }
        if let Some(key) = session_cookie(headers) {
            return self.resolve_key(key);
        }
        None
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    value.strip_prefix("Bearer ").map(str::trim)
}

fn session_cookie(headers: &HeaderMap) -> Option<&str> {
    let raw = headers.get(COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE).then_some(value)
    })
}
