//! Sandboxed HTTP API (`http.*`).
//!
//! Every entry point applies the domain gate before a request is built.
//! Default `User-Agent` and `Content-Type` headers are applied only when the
//! extension did not set them; object and array bodies are JSON-serialized
//! automatically. Responses are read to completion and returned as plain
//! value trees; multi-valued headers become arrays. Cookies persist in the
//! runtime's in-memory jar until `http.clearCookies()`.

use crate::error::{Error, Result};
use crate::http_util::DEFAULT_USER_AGENT;
use crate::netguard;
use crate::runtime::{error_value, json_to_js, opt_value_to_json, ApiState};
use rquickjs::function::{Func, Opt};
use rquickjs::{Ctx, Object, Value};
use serde_json::Value as Json;
use std::sync::Arc;
use tracing::warn;

/// Parts of a completed exchange, shared with the `fetch` polyfill.
pub(crate) struct HttpExchange {
    pub(crate) status: u16,
    pub(crate) status_text: String,
    pub(crate) headers: Json,
    pub(crate) body: String,
}

impl ApiState {
    /// Gate, perform, and shape a request into the `http.*` response value.
    pub(crate) fn http_call(&self, method: &str, url: &str, body: &Json, headers: &Json) -> Json {
        match self.http_exchange(method, url, body, headers) {
            Ok(exchange) => serde_json::json!({
                "statusCode": exchange.status,
                "status": exchange.status,
                "ok": (200..300).contains(&exchange.status),
                "body": exchange.body,
                "headers": exchange.headers,
            }),
            Err(err) => {
                warn!(extension = %self.extension.id, url, "HTTP blocked or failed: {err}");
                error_value(err.to_string())
            }
        }
    }

    /// Gate and perform a request, returning the raw exchange parts.
    pub(crate) fn http_exchange(
        &self,
        method: &str,
        url: &str,
        body: &Json,
        headers: &Json,
    ) -> Result<HttpExchange> {
        netguard::validate_domain(&self.extension.manifest, url)?;

        let method = reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|_| Error::validation(format!("invalid HTTP method: {method}")))?;
        let is_post = method == reqwest::Method::POST;

        let client = self.http_client()?;
        let mut request = client.request(method, url);

        let mut has_user_agent = false;
        let mut has_content_type = false;
        if let Some(map) = headers.as_object() {
            for (name, value) in map {
                if name.eq_ignore_ascii_case("user-agent") {
                    has_user_agent = true;
                }
                if name.eq_ignore_ascii_case("content-type") {
                    has_content_type = true;
                }
                request = request.header(name.as_str(), json_scalar_to_string(value));
            }
        }
        if !has_user_agent {
            request = request.header("User-Agent", DEFAULT_USER_AGENT);
        }

        let body_payload = encode_body(body)?;
        // POST defaults to a JSON content type even for empty bodies.
        if (body_payload.is_some() || is_post) && !has_content_type {
            request = request.header("Content-Type", "application/json");
        }
        if let Some(payload) = body_payload {
            request = request.body(payload);
        }

        let response = request.send()?;
        response_to_exchange(response)
    }
}

/// Bodies may be strings (sent verbatim) or structured values (serialized as
/// JSON). Empty strings and null mean "no body".
fn encode_body(body: &Json) -> Result<Option<String>> {
    match body {
        Json::Null => Ok(None),
        Json::String(text) if text.is_empty() => Ok(None),
        Json::String(text) => Ok(Some(text.clone())),
        Json::Object(_) | Json::Array(_) => Ok(Some(serde_json::to_string(body)?)),
        other => Ok(Some(other.to_string())),
    }
}

pub(crate) fn json_scalar_to_string(value: &Json) -> String {
    match value {
        Json::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn response_to_exchange(response: reqwest::blocking::Response) -> Result<HttpExchange> {
    let status = response.status();
    let mut headers = serde_json::Map::new();
    for name in response.headers().keys() {
        let values: Vec<String> = response
            .headers()
            .get_all(name)
            .iter()
            .filter_map(|value| value.to_str().ok().map(str::to_string))
            .collect();
        let entry = if values.len() == 1 {
            Json::String(values.into_iter().next().unwrap_or_default())
        } else {
            serde_json::json!(values)
        };
        headers.insert(name.as_str().to_string(), entry);
    }

    let body = response.text()?;
    Ok(HttpExchange {
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or("").to_string(),
        headers: Json::Object(headers),
        body,
    })
}

pub(crate) fn register(ctx: &Ctx<'_>, state: &Arc<ApiState>) -> rquickjs::Result<()> {
    let http = Object::new(ctx.clone())?;

    let st = Arc::clone(state);
    http.set(
        "get",
        Func::from(crate::runtime::constrain2(
            move |ctx: Ctx<'_>, url: String, headers: Opt<Value>| -> rquickjs::Result<Value> {
                let headers = opt_value_to_json(headers.0.as_ref());
                json_to_js(&ctx, &st.http_call("GET", &url, &Json::Null, &headers))
            },
        )),
    )?;

    let st = Arc::clone(state);
    http.set(
        "post",
        Func::from(crate::runtime::constrain3(
            move |ctx: Ctx<'_>,
                  url: String,
                  body: Opt<Value>,
                  headers: Opt<Value>|
                  -> rquickjs::Result<Value> {
                let body = opt_value_to_json(body.0.as_ref());
                let headers = opt_value_to_json(headers.0.as_ref());
                json_to_js(&ctx, &st.http_call("POST", &url, &body, &headers))
            },
        )),
    )?;

    let st = Arc::clone(state);
    http.set(
        "put",
        Func::from(crate::runtime::constrain3(
            move |ctx: Ctx<'_>,
                  url: String,
                  body: Opt<Value>,
                  headers: Opt<Value>|
                  -> rquickjs::Result<Value> {
                let body = opt_value_to_json(body.0.as_ref());
                let headers = opt_value_to_json(headers.0.as_ref());
                json_to_js(&ctx, &st.http_call("PUT", &url, &body, &headers))
            },
        )),
    )?;

    let st = Arc::clone(state);
    http.set(
        "patch",
        Func::from(crate::runtime::constrain3(
            move |ctx: Ctx<'_>,
                  url: String,
                  body: Opt<Value>,
                  headers: Opt<Value>|
                  -> rquickjs::Result<Value> {
                let body = opt_value_to_json(body.0.as_ref());
                let headers = opt_value_to_json(headers.0.as_ref());
                json_to_js(&ctx, &st.http_call("PATCH", &url, &body, &headers))
            },
        )),
    )?;

    // delete(url, headers): no body slot.
    let st = Arc::clone(state);
    http.set(
        "delete",
        Func::from(crate::runtime::constrain2(
            move |ctx: Ctx<'_>, url: String, headers: Opt<Value>| -> rquickjs::Result<Value> {
                let headers = opt_value_to_json(headers.0.as_ref());
                json_to_js(&ctx, &st.http_call("DELETE", &url, &Json::Null, &headers))
            },
        )),
    )?;

    // request(url, { method, body, headers })
    let st = Arc::clone(state);
    http.set(
        "request",
        Func::from(crate::runtime::constrain2(
            move |ctx: Ctx<'_>, url: String, options: Opt<Value>| -> rquickjs::Result<Value> {
                let options = opt_value_to_json(options.0.as_ref());
                let method = options
                    .get("method")
                    .and_then(Json::as_str)
                    .unwrap_or("GET")
                    .to_string();
                let body = options.get("body").cloned().unwrap_or(Json::Null);
                let headers = options.get("headers").cloned().unwrap_or(Json::Null);
                json_to_js(&ctx, &st.http_call(&method, &url, &body, &headers))
            },
        )),
    )?;

    let st = Arc::clone(state);
    http.set(
        "clearCookies",
        Func::from(move || -> bool {
            st.clear_cookies();
            true
        }),
    )?;

    ctx.globals().set("http", http)?;
    Ok(())
}
