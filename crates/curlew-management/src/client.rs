// crates/curlew-management/src/client.rs
// ============================================================================
// Module: Management Service Client
// Description: Blocking client for the platform management API.
// Purpose: Registry, configuration categories, asset tracking, audit, and
//          bearer-token verification for the readings service.
// Dependencies: curlew-core, reqwest, serde, serde_json, thiserror
// ============================================================================

//! ## Overview
//! A thin blocking client over the management surface the readings service
//! consumes: `/fledge/service` registration, `/fledge/interest`,
//! `/fledge/service/category/...`, `/fledge/track`, `/fledge/audit`, and
//! the token verify/refresh endpoints. Responses are JSON objects; a
//! `message` member signals an API-level failure. Verified bearer tokens
//! are cached behind a mutex so repeated requests skip the round trip.
//! Management failures never block the data path: callers log, keep their
//! state, and retry on their next tick.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use curlew_core::AssetTrackerApi;
use curlew_core::AssetTrackingTuple;
use curlew_core::ManagementError;
use reqwest::blocking::Client;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use tracing::error;
use tracing::info;

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// Management client configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ManagementClientConfig {
    /// Base URL of the management service, e.g. `http://127.0.0.1:8081`.
    pub base_url: String,
    /// Request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

/// Returns the default request timeout in milliseconds.
const fn default_timeout_ms() -> u64 {
    10_000
}

/// Identity of a service registered with the management core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Service name.
    pub name: String,
    /// Service type, e.g. `Southbound`.
    #[serde(rename = "type")]
    pub service_type: String,
    /// Service protocol.
    pub protocol: String,
    /// Service address.
    pub address: String,
    /// Service port.
    pub service_port: u16,
    /// Management port of the service.
    pub management_port: u16,
}

/// Claims extracted from a verified bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenClaims {
    /// Audience (the service the token was issued to).
    #[serde(default)]
    pub aud: String,
    /// Subject (the caller).
    #[serde(default)]
    pub sub: String,
    /// Issuer.
    #[serde(default)]
    pub iss: String,
    /// Expiry, unix seconds.
    #[serde(default)]
    pub exp: i64,
}

// ============================================================================
// SECTION: Client
// ============================================================================

/// Blocking management API client.
pub struct ManagementClient {
    /// Base URL without a trailing slash.
    base_url: String,
    /// Shared blocking HTTP client.
    client: Client,
    /// UUID assigned at registration.
    uuid: Mutex<Option<String>>,
    /// Bearer token assigned at registration or refresh.
    bearer_token: Mutex<Option<String>>,
    /// Verified-token cache.
    received_tokens: Mutex<HashMap<String, TokenClaims>>,
}

impl ManagementClient {
    /// Creates a client for the given management service.
    ///
    /// # Errors
    ///
    /// Returns [`ManagementError::Http`] when the HTTP client cannot be
    /// built.
    pub fn new(config: &ManagementClientConfig) -> Result<Self, ManagementError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|err| ManagementError::Http(err.to_string()))?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
            uuid: Mutex::new(None),
            bearer_token: Mutex::new(None),
            received_tokens: Mutex::new(HashMap::new()),
        })
    }

    /// UUID assigned by the most recent registration.
    #[must_use]
    pub fn uuid(&self) -> Option<String> {
        self.lock(&self.uuid).clone()
    }

    // ------------------------------------------------------------------
    // Service registry
    // ------------------------------------------------------------------

    /// Registers this service with the management core, retaining the
    /// assigned UUID and bearer token.
    ///
    /// # Errors
    ///
    /// Returns [`ManagementError`] on transport failure or an API-level
    /// rejection.
    pub fn register_service(&self, service: &ServiceRecord) -> Result<(), ManagementError> {
        let body = serde_json::to_value(service)
            .map_err(|err| ManagementError::Api(err.to_string()))?;
        let response = self.post("/fledge/service", &body)?;
        let id = response
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ManagementError::Api("registration returned no id".to_string()))?;
        *self.lock(&self.uuid) = Some(id.to_string());
        if let Some(token) = response.get("bearer_token").and_then(Value::as_str) {
            *self.lock(&self.bearer_token) = Some(token.to_string());
        }
        info!(service = %service.name, id, "registered service");
        Ok(())
    }

    /// Removes this service's registration.
    ///
    /// # Errors
    ///
    /// Returns [`ManagementError`] when no registration exists or the
    /// request fails.
    pub fn unregister_service(&self) -> Result<(), ManagementError> {
        let Some(uuid) = self.uuid() else {
            return Err(ManagementError::Api("service is not registered".to_string()));
        };
        let url = format!("{}/fledge/service/{uuid}", self.base_url);
        let response = self
            .client
            .delete(url)
            .send()
            .map_err(|err| ManagementError::Http(err.to_string()))?;
        parse_object(&response.text().map_err(|err| ManagementError::Http(err.to_string()))?)?;
        Ok(())
    }

    /// Looks up registered services by name.
    ///
    /// # Errors
    ///
    /// Returns [`ManagementError`] on transport or API failure.
    pub fn get_service(&self, name: &str) -> Result<Vec<ServiceRecord>, ManagementError> {
        let response = self.get(&format!("/fledge/service?name={}", url_encode(name)))?;
        let services = response
            .get("services")
            .and_then(Value::as_array)
            .ok_or_else(|| ManagementError::Api("expected a services array".to_string()))?;
        services
            .iter()
            .map(|service| {
                serde_json::from_value(service.clone())
                    .map_err(|err| ManagementError::Api(err.to_string()))
            })
            .collect()
    }

    /// Registers interest in a configuration category, so the core calls
    /// back on changes.
    ///
    /// # Errors
    ///
    /// Returns [`ManagementError`] on transport or API failure.
    pub fn register_category_interest(&self, category: &str) -> Result<(), ManagementError> {
        let Some(uuid) = self.uuid() else {
            return Err(ManagementError::Api("service is not registered".to_string()));
        };
        let body = json!({"category": category, "service": uuid});
        self.post("/fledge/interest", &body).map(|_| ())
    }

    // ------------------------------------------------------------------
    // Configuration categories
    // ------------------------------------------------------------------

    /// Fetches a whole configuration category.
    ///
    /// # Errors
    ///
    /// Returns [`ManagementError`] on transport or API failure.
    pub fn get_category(&self, category: &str) -> Result<Value, ManagementError> {
        self.get(&format!("/fledge/service/category/{}", url_encode(category)))
    }

    /// Fetches one item of a configuration category.
    ///
    /// # Errors
    ///
    /// Returns [`ManagementError`] on transport or API failure.
    pub fn get_category_item(&self, category: &str, item: &str) -> Result<Value, ManagementError> {
        self.get(&format!(
            "/fledge/service/category/{}/{}",
            url_encode(category),
            url_encode(item)
        ))
    }

    /// Updates one item of a configuration category.
    ///
    /// # Errors
    ///
    /// Returns [`ManagementError`] on transport or API failure.
    pub fn set_category_item_value(
        &self,
        category: &str,
        item: &str,
        value: &str,
    ) -> Result<(), ManagementError> {
        let url = format!(
            "{}/fledge/service/category/{}/{}",
            self.base_url,
            url_encode(category),
            url_encode(item)
        );
        let response = self
            .client
            .put(url)
            .json(&json!({"value": value}))
            .send()
            .map_err(|err| ManagementError::Http(err.to_string()))?;
        parse_object(&response.text().map_err(|err| ManagementError::Http(err.to_string()))?)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Audit
    // ------------------------------------------------------------------

    /// Records an auditable event.
    ///
    /// # Errors
    ///
    /// Returns [`ManagementError`] on transport or API failure.
    pub fn add_audit_entry(
        &self,
        code: &str,
        severity: &str,
        details: &Value,
    ) -> Result<(), ManagementError> {
        let body = json!({"source": code, "severity": severity, "details": details});
        self.post("/fledge/audit", &body).map(|_| ())
    }

    // ------------------------------------------------------------------
    // Tokens
    // ------------------------------------------------------------------

    /// Verifies a peer bearer token, consulting the cache first.
    ///
    /// # Errors
    ///
    /// Returns [`ManagementError::Token`] when the service rejects the
    /// token.
    pub fn verify_access_bearer_token(&self, token: &str) -> Result<TokenClaims, ManagementError> {
        if let Some(claims) = self.lock(&self.received_tokens).get(token) {
            return Ok(claims.clone());
        }
        let response = self.post_authorized("/fledge/service/verify_token", &json!({}), token)?;
        if response.get("error").is_some() {
            return Err(ManagementError::Token(response.to_string()));
        }
        let claims: TokenClaims = serde_json::from_value(response)
            .map_err(|err| ManagementError::Token(err.to_string()))?;
        self.lock(&self.received_tokens).insert(token.to_string(), claims.clone());
        Ok(claims)
    }

    /// Refreshes this service's own bearer token.
    ///
    /// # Errors
    ///
    /// Returns [`ManagementError::Token`] when no token is held or the
    /// refresh is rejected.
    pub fn refresh_bearer_token(&self) -> Result<String, ManagementError> {
        let Some(current) = self.lock(&self.bearer_token).clone() else {
            return Err(ManagementError::Token("no bearer token to refresh".to_string()));
        };
        let response =
            self.post_authorized("/fledge/service/refresh_token", &json!({}), &current)?;
        let refreshed = response
            .get("bearer_token")
            .and_then(Value::as_str)
            .ok_or_else(|| ManagementError::Token("refresh returned no token".to_string()))?;
        *self.lock(&self.bearer_token) = Some(refreshed.to_string());
        Ok(refreshed.to_string())
    }

    // ------------------------------------------------------------------
    // Transport helpers
    // ------------------------------------------------------------------

    fn get(&self, path: &str) -> Result<Value, ManagementError> {
        let response = self
            .client
            .get(format!("{}{path}", self.base_url))
            .send()
            .map_err(|err| ManagementError::Http(err.to_string()))?;
        parse_object(&response.text().map_err(|err| ManagementError::Http(err.to_string()))?)
    }

    fn post(&self, path: &str, body: &Value) -> Result<Value, ManagementError> {
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .json(body)
            .send()
            .map_err(|err| ManagementError::Http(err.to_string()))?;
        parse_object(&response.text().map_err(|err| ManagementError::Http(err.to_string()))?)
    }

    fn post_authorized(
        &self,
        path: &str,
        body: &Value,
        token: &str,
    ) -> Result<Value, ManagementError> {
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(token)
            .json(body)
            .send()
            .map_err(|err| ManagementError::Http(err.to_string()))?;
        parse_object(&response.text().map_err(|err| ManagementError::Http(err.to_string()))?)
    }

    fn lock<'mutex, T>(&self, mutex: &'mutex Mutex<T>) -> std::sync::MutexGuard<'mutex, T> {
        mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

// ============================================================================
// SECTION: Asset Tracker Seam
// ============================================================================

impl AssetTrackerApi for ManagementClient {
    fn tuples(
        &self,
        service: &str,
        event: &str,
    ) -> Result<Vec<AssetTrackingTuple>, ManagementError> {
        let response = self.get(&format!("/fledge/track?service={}", url_encode(service)))?;
        let track = response
            .get("track")
            .and_then(Value::as_array)
            .ok_or_else(|| ManagementError::Api("expected a track array".to_string()))?;
        let mut tuples = Vec::with_capacity(track.len());
        for record in track {
            let field = |name: &str| {
                record.get(name).and_then(Value::as_str).map(ToString::to_string).ok_or_else(
                    || ManagementError::Api(format!("track record is missing {name}")),
                )
            };
            let tuple = AssetTrackingTuple {
                service: field("service")?,
                plugin: field("plugin")?,
                asset: field("asset")?,
                event: field("event")?,
            };
            if tuple.event == event {
                tuples.push(tuple);
            }
        }
        Ok(tuples)
    }

    fn record_tuple(&self, tuple: &AssetTrackingTuple) -> Result<(), ManagementError> {
        let body = json!({
            "service": tuple.service,
            "plugin": tuple.plugin,
            "asset": tuple.asset,
            "event": tuple.event,
        });
        match self.post("/fledge/track", &body) {
            Ok(_) => Ok(()),
            Err(err) => {
                error!(asset = %tuple.asset, error = %err, "failed to add asset tracking tuple");
                Err(err)
            }
        }
    }
}

// ============================================================================
// SECTION: Parsing Helpers
// ============================================================================

/// Parses a management response body, mapping `message` members onto API
/// errors and the core's `NNN:` prefix onto HTTP errors.
pub(crate) fn parse_object(body: &str) -> Result<Value, ManagementError> {
    match serde_json::from_str::<Value>(body) {
        Ok(value) => {
            if let Some(message) = value.get("message").and_then(Value::as_str) {
                return Err(ManagementError::Api(message.to_string()));
            }
            Ok(value)
        }
        Err(_) => {
            let bytes = body.as_bytes();
            let http_error = bytes.len() > 3
                && bytes[.. 3].iter().all(u8::is_ascii_digit)
                && bytes[3] == b':';
            if http_error {
                Err(ManagementError::Http(body.to_string()))
            } else {
                Err(ManagementError::Api(format!("unparseable response: {body}")))
            }
        }
    }
}

/// Percent-encodes a path or query component.
pub(crate) fn url_encode(raw: &str) -> String {
    let mut encoded = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A' ..= b'Z' | b'a' ..= b'z' | b'0' ..= b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char);
            }
            other => {
                encoded.push_str(&format!("%{other:02X}"));
            }
        }
    }
    encoded
}

// ============================================================================
// SECTION: Tests
// ============================================================================
