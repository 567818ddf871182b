//! OAuth coordinator (`auth.*`) with PKCE support.
//!
//! The browser round-trip is mediated by the outer application: starting a
//! flow registers a pending auth request the app observes and resolves, and
//! the extension later reads the delivered code or exchanges it for tokens.
//! PKCE follows RFC 7636: a high-entropy verifier (clamped to 43..=128
//! characters), an S256 challenge without padding, and a form-encoded token
//! request carrying `code_verifier`.

use crate::error::Result;
use crate::http_util::DEFAULT_USER_AGENT;
use crate::netguard;
use crate::runtime::{failure_value, json_to_js, opt_value_to_json, ApiState};
use crate::services::PendingAuthRequest;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::RngCore;
use rquickjs::function::{Func, Opt};
use rquickjs::{Ctx, Object, Value};
use serde_json::Value as Json;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info};
use url::Url;

const DEFAULT_VERIFIER_LEN: usize = 64;

/// Generate a PKCE code verifier of the requested length, clamped to the
/// RFC 7636 range 43..=128. Uses the base64url alphabet.
pub fn generate_pkce_verifier(length: usize) -> String {
    let length = length.clamp(43, 128);
    let mut bytes = vec![0_u8; length];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut verifier = URL_SAFE_NO_PAD.encode(&bytes);
    verifier.truncate(length);
    verifier
}

/// `challenge = base64url(sha256(verifier))`, no padding.
pub fn pkce_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

impl ApiState {
    pub(crate) fn auth_open_url(&self, auth_url: &str, callback_url: &str) -> Json {
        self.services.put_pending_auth_request(PendingAuthRequest {
            extension_id: self.extension.id.clone(),
            auth_url: auth_url.to_string(),
            callback_url: callback_url.to_string(),
        });
        self.services.with_auth_state(&self.extension.id, |state| {
            state.pending_auth_url = auth_url.to_string();
            state.auth_code.clear();
        });

        info!(extension = %self.extension.id, "auth URL requested");
        serde_json::json!({
            "success": true,
            "message": "Auth URL will be opened by the app",
        })
    }

    pub(crate) fn auth_get_code(&self) -> Option<String> {
        let state = self.services.auth_state(&self.extension.id);
        (!state.auth_code.is_empty()).then_some(state.auth_code)
    }

    pub(crate) fn auth_get_tokens(&self) -> Json {
        let state = self.services.auth_state(&self.extension.id);
        let mut tokens = serde_json::json!({
            "access_token": state.access_token,
            "refresh_token": state.refresh_token,
            "is_authenticated": state.is_authenticated,
        });
        if let Some(expires_at) = state.expires_at {
            let unix = expires_at
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            tokens["expires_at"] = serde_json::json!(unix);
            tokens["is_expired"] = serde_json::json!(SystemTime::now() > expires_at);
        }
        tokens
    }

    pub(crate) fn auth_generate_pkce(&self, length: Option<f64>) -> Json {
        let length = match length {
            Some(requested) if (43.0..=128.0).contains(&requested) => requested as usize,
            _ => DEFAULT_VERIFIER_LEN,
        };
        let verifier = generate_pkce_verifier(length);
        let challenge = pkce_challenge(&verifier);

        self.services.with_auth_state(&self.extension.id, |state| {
            state.pkce_verifier = verifier.clone();
            state.pkce_challenge = challenge.clone();
        });

        debug!(extension = %self.extension.id, length = verifier.len(), "PKCE generated");
        serde_json::json!({
            "verifier": verifier,
            "challenge": challenge,
            "method": "S256",
        })
    }

    pub(crate) fn auth_get_pkce(&self) -> Json {
        let state = self.services.auth_state(&self.extension.id);
        if state.pkce_verifier.is_empty() {
            return serde_json::json!({});
        }
        serde_json::json!({
            "verifier": state.pkce_verifier,
            "challenge": state.pkce_challenge,
            "method": "S256",
        })
    }

    /// Generate PKCE material, assemble the RFC 6749 authorization URL, and
    /// register the pending handoff for the outer app.
    pub(crate) fn auth_start_oauth(&self, config: &Json) -> Json {
        let auth_url = config.get("authUrl").and_then(Json::as_str).unwrap_or("");
        let client_id = config.get("clientId").and_then(Json::as_str).unwrap_or("");
        let redirect_uri = config
            .get("redirectUri")
            .and_then(Json::as_str)
            .unwrap_or("");
        if auth_url.is_empty() || client_id.is_empty() || redirect_uri.is_empty() {
            return failure_value("authUrl, clientId, and redirectUri are required");
        }

        let verifier = generate_pkce_verifier(DEFAULT_VERIFIER_LEN);
        let challenge = pkce_challenge(&verifier);

        self.services.with_auth_state(&self.extension.id, |state| {
            state.pkce_verifier = verifier.clone();
            state.pkce_challenge = challenge.clone();
            state.auth_code.clear();
        });

        let mut parsed = match Url::parse(auth_url) {
            Ok(parsed) => parsed,
            Err(err) => return failure_value(format!("invalid authUrl: {err}")),
        };
        {
            let mut query = parsed.query_pairs_mut();
            query.append_pair("client_id", client_id);
            query.append_pair("redirect_uri", redirect_uri);
            query.append_pair("response_type", "code");
            query.append_pair("code_challenge", &challenge);
            query.append_pair("code_challenge_method", "S256");
            if let Some(scope) = config.get("scope").and_then(Json::as_str) {
                if !scope.is_empty() {
                    query.append_pair("scope", scope);
                }
            }
            if let Some(extra) = config.get("extraParams").and_then(Json::as_object) {
                for (key, value) in extra {
                    query.append_pair(key, &crate::runtime_http::json_scalar_to_string(value));
                }
            }
        }
        let full_auth_url = parsed.to_string();

        self.services.put_pending_auth_request(PendingAuthRequest {
            extension_id: self.extension.id.clone(),
            auth_url: full_auth_url.clone(),
            callback_url: redirect_uri.to_string(),
        });
        self.services.with_auth_state(&self.extension.id, |state| {
            state.pending_auth_url = full_auth_url.clone();
        });

        info!(extension = %self.extension.id, "PKCE OAuth flow started");
        serde_json::json!({
            "success": true,
            "authUrl": full_auth_url,
            "pkce": {
                "verifier": verifier,
                "challenge": challenge,
                "method": "S256",
            },
        })
    }

    /// Exchange the authorization code for tokens, carrying the stored PKCE
    /// verifier. On success tokens are stored, `expiresAt` is tracked, and
    /// the verifier/challenge are cleared.
    pub(crate) fn auth_exchange_code(&self, config: &Json) -> Json {
        let token_url = config.get("tokenUrl").and_then(Json::as_str).unwrap_or("");
        let client_id = config.get("clientId").and_then(Json::as_str).unwrap_or("");
        let code = config.get("code").and_then(Json::as_str).unwrap_or("");
        let redirect_uri = config
            .get("redirectUri")
            .and_then(Json::as_str)
            .unwrap_or("");
        if token_url.is_empty() || client_id.is_empty() || code.is_empty() {
            return failure_value("tokenUrl, clientId, and code are required");
        }

        let verifier = self.services.auth_state(&self.extension.id).pkce_verifier;
        if verifier.is_empty() {
            return failure_value(
                "no PKCE verifier found - call generatePKCE or startOAuthWithPKCE first",
            );
        }

        if let Err(err) = netguard::validate_domain(&self.extension.manifest, token_url) {
            return failure_value(err.to_string());
        }

        let mut form: Vec<(String, String)> = vec![
            ("grant_type".into(), "authorization_code".into()),
            ("client_id".into(), client_id.into()),
            ("code".into(), code.into()),
            ("code_verifier".into(), verifier),
        ];
        if !redirect_uri.is_empty() {
            form.push(("redirect_uri".into(), redirect_uri.into()));
        }
        if let Some(extra) = config.get("extraParams").and_then(Json::as_object) {
            for (key, value) in extra {
                form.push((
                    key.clone(),
                    crate::runtime_http::json_scalar_to_string(value),
                ));
            }
        }

        let body = match self.post_token_request(token_url, &form) {
            Ok(body) => body,
            Err(err) => return failure_value(err.to_string()),
        };

        let token_response: Json = match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => {
                let mut result =
                    failure_value(format!("failed to parse token response: {err}"));
                result["body"] = serde_json::json!(body);
                return result;
            }
        };

        if let Some(error) = token_response.get("error").and_then(Json::as_str) {
            let description = token_response
                .get("error_description")
                .and_then(Json::as_str)
                .unwrap_or("");
            let mut result = failure_value(error);
            result["error_description"] = serde_json::json!(description);
            return result;
        }

        let access_token = token_response
            .get("access_token")
            .and_then(Json::as_str)
            .unwrap_or("");
        if access_token.is_empty() {
            let mut result = failure_value("no access_token in response");
            result["body"] = serde_json::json!(body);
            return result;
        }
        let refresh_token = token_response
            .get("refresh_token")
            .and_then(Json::as_str)
            .unwrap_or("");
        let expires_in = token_response
            .get("expires_in")
            .and_then(Json::as_f64)
            .unwrap_or(0.0);

        self.services.with_auth_state(&self.extension.id, |state| {
            state.access_token = access_token.to_string();
            state.refresh_token = refresh_token.to_string();
            state.is_authenticated = true;
            if expires_in > 0.0 {
                state.expires_at =
                    Some(SystemTime::now() + Duration::from_secs_f64(expires_in));
            }
            state.pkce_verifier.clear();
            state.pkce_challenge.clear();
        });

        info!(extension = %self.extension.id, "PKCE token exchange successful");
        let mut result = serde_json::json!({
            "success": true,
            "access_token": access_token,
            "refresh_token": refresh_token,
            "token_type": token_response.get("token_type").cloned().unwrap_or(Json::Null),
        });
        if expires_in > 0.0 {
            result["expires_in"] = serde_json::json!(expires_in);
        }
        if let Some(scope) = token_response.get("scope").and_then(Json::as_str) {
            result["scope"] = serde_json::json!(scope);
        }
        result
    }

    fn post_token_request(&self, token_url: &str, form: &[(String, String)]) -> Result<String> {
        let client = self.http_client()?;
        let response = client
            .post(token_url)
            .header("User-Agent", DEFAULT_USER_AGENT)
            .form(form)
            .send()?;
        Ok(response.text()?)
    }
}

pub(crate) fn register(ctx: &Ctx<'_>, state: &Arc<ApiState>) -> rquickjs::Result<()> {
    let auth = Object::new(ctx.clone())?;

    let st = Arc::clone(state);
    auth.set(
        "openUrl",
        Func::from(crate::runtime::constrain2(
            move |ctx: Ctx<'_>, url: String, callback: Opt<String>| -> rquickjs::Result<Value> {
                let callback = callback.0.unwrap_or_default();
                json_to_js(&ctx, &st.auth_open_url(&url, &callback))
            },
        )),
    )?;

    let st = Arc::clone(state);
    auth.set(
        "getCode",
        Func::from(crate::runtime::constrain0(
            move |ctx: Ctx<'_>| -> rquickjs::Result<Value> {
                match st.auth_get_code() {
                    Some(code) => json_to_js(&ctx, &serde_json::json!(code)),
                    None => Ok(Value::new_undefined(ctx.clone())),
                }
            },
        )),
    )?;

    let st = Arc::clone(state);
    auth.set(
        "setCode",
        Func::from(move |value: Value| -> bool {
            let value = opt_value_to_json(Some(&value));
            st.services.set_auth_code(&st.extension.id, &value);
            true
        }),
    )?;

    let st = Arc::clone(state);
    auth.set(
        "clear",
        Func::from(move || -> bool {
            st.services.clear_auth(&st.extension.id);
            true
        }),
    )?;

    let st = Arc::clone(state);
    auth.set(
        "isAuthenticated",
        Func::from(move || -> bool { st.services.is_authenticated(&st.extension.id) }),
    )?;

    let st = Arc::clone(state);
    auth.set(
        "getTokens",
        Func::from(crate::runtime::constrain0(
            move |ctx: Ctx<'_>| -> rquickjs::Result<Value> {
                json_to_js(&ctx, &st.auth_get_tokens())
            },
        )),
    )?;

    let st = Arc::clone(state);
    auth.set(
        "generatePKCE",
        Func::from(crate::runtime::constrain1(
            move |ctx: Ctx<'_>, length: Opt<f64>| -> rquickjs::Result<Value> {
                json_to_js(&ctx, &st.auth_generate_pkce(length.0))
            },
        )),
    )?;

    let st = Arc::clone(state);
    auth.set(
        "getPKCE",
        Func::from(crate::runtime::constrain0(
            move |ctx: Ctx<'_>| -> rquickjs::Result<Value> {
                json_to_js(&ctx, &st.auth_get_pkce())
            },
        )),
    )?;

    let st = Arc::clone(state);
    auth.set(
        "startOAuthWithPKCE",
        Func::from(crate::runtime::constrain1(
            move |ctx: Ctx<'_>, config: Value| -> rquickjs::Result<Value> {
                let config = opt_value_to_json(Some(&config));
                if !config.is_object() {
                    return json_to_js(&ctx, &failure_value("config must be an object"));
                }
                json_to_js(&ctx, &st.auth_start_oauth(&config))
            },
        )),
    )?;

    let st = Arc::clone(state);
    auth.set(
        "exchangeCodeWithPKCE",
        Func::from(crate::runtime::constrain1(
            move |ctx: Ctx<'_>, config: Value| -> rquickjs::Result<Value> {
                let config = opt_value_to_json(Some(&config));
                if !config.is_object() {
                    return json_to_js(&ctx, &failure_value("config must be an object"));
                }
                json_to_js(&ctx, &st.auth_exchange_code(&config))
            },
        )),
    )?;

    ctx.globals().set("auth", auth)?;
    Ok(())
}
