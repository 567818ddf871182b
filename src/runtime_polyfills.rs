//! Browser-compatible polyfills.
//!
//! Installed as globals so extensions can reuse browser-targeted libraries
//! without widening the sandbox: `fetch` rides the same gated HTTP handle as
//! `http.request`, `atob`/`btoa` wrap base64, and
//! `TextEncoder`/`TextDecoder`/`URL`/`URLSearchParams` are small JS classes
//! over native hostcalls (`__tv_*_native`), mirroring how the host's other
//! shims are built.

use crate::runtime::{json_to_js, opt_value_to_json, ApiState};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rquickjs::function::{Func, Opt};
use rquickjs::{Ctx, Object, Value};
use serde_json::Value as Json;
use std::sync::Arc;
use tracing::warn;
use url::Url;

pub(crate) fn register(ctx: &Ctx<'_>, state: &Arc<ApiState>) -> rquickjs::Result<()> {
    register_fetch(ctx, state)?;
    register_base64(ctx)?;
    register_natives(ctx)?;
    ctx.eval::<(), _>(POLYFILL_JS)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// fetch
// ---------------------------------------------------------------------------

fn register_fetch(ctx: &Ctx<'_>, state: &Arc<ApiState>) -> rquickjs::Result<()> {
    let st = Arc::clone(state);
    ctx.globals().set(
        "fetch",
        Func::from(
            move |ctx: Ctx<'_>, url: String, init: Opt<Value>| -> rquickjs::Result<Value> {
                let init = opt_value_to_json(init.0.as_ref());
                let method = init
                    .get("method")
                    .and_then(Json::as_str)
                    .unwrap_or("GET")
                    .to_string();
                let body = init.get("body").cloned().unwrap_or(Json::Null);
                let headers = init.get("headers").cloned().unwrap_or(Json::Null);

                match st.http_exchange(&method, &url, &body, &headers) {
                    Ok(exchange) => build_response_object(
                        &ctx,
                        &url,
                        exchange.status,
                        &exchange.status_text,
                        &exchange.headers,
                        exchange.body,
                    ),
                    Err(err) => {
                        warn!(extension = %st.extension.id, url, "fetch blocked: {err}");
                        build_error_response(&ctx, &err.to_string())
                    }
                }
            },
        ),
    )
}

fn build_response_object<'js>(
    ctx: &Ctx<'js>,
    url: &str,
    status: u16,
    status_text: &str,
    headers: &Json,
    body: String,
) -> rquickjs::Result<Value<'js>> {
    let response = Object::new(ctx.clone())?;
    response.set("ok", (200..300).contains(&status))?;
    response.set("status", status)?;
    response.set("statusText", status_text)?;
    response.set("headers", json_to_js(ctx, headers)?)?;
    response.set("url", url)?;

    let text_body = body.clone();
    response.set(
        "text",
        Func::from(move || -> String { text_body.clone() }),
    )?;

    let json_body = body.clone();
    response.set(
        "json",
        Func::from(move |ctx: Ctx<'_>| -> rquickjs::Result<Value> {
            match serde_json::from_str::<Json>(&json_body) {
                Ok(value) => json_to_js(&ctx, &value),
                Err(_) => Ok(Value::new_undefined(ctx.clone())),
            }
        }),
    )?;

    let bytes = body.into_bytes();
    response.set(
        "arrayBuffer",
        Func::from(move || -> Vec<u8> { bytes.clone() }),
    )?;

    Ok(response.into_value())
}

fn build_error_response<'js>(ctx: &Ctx<'js>, message: &str) -> rquickjs::Result<Value<'js>> {
    let response = Object::new(ctx.clone())?;
    response.set("ok", false)?;
    response.set("status", 0)?;
    response.set("statusText", "Network Error")?;
    response.set("error", message)?;
    response.set("text", Func::from(|| -> String { String::new() }))?;
    response.set(
        "json",
        Func::from(|ctx: Ctx<'_>| -> rquickjs::Result<Value> {
            Ok(Value::new_undefined(ctx.clone()))
        }),
    )?;
    Ok(response.into_value())
}

// ---------------------------------------------------------------------------
// atob / btoa
// ---------------------------------------------------------------------------

fn register_base64(ctx: &Ctx<'_>) -> rquickjs::Result<()> {
    ctx.globals().set(
        "btoa",
        Func::from(|input: String| -> String {
            // Binary strings: keep the low byte of each code point.
            let bytes: Vec<u8> = input.chars().map(|c| (c as u32 & 0xff) as u8).collect();
            STANDARD.encode(bytes)
        }),
    )?;

    ctx.globals().set(
        "atob",
        Func::from(|input: String| -> String {
            crate::runtime_utils::base64_decode_lenient(&input)
        }),
    )?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Native hostcalls backing the JS classes
// ---------------------------------------------------------------------------

fn register_natives(ctx: &Ctx<'_>) -> rquickjs::Result<()> {
    let globals = ctx.globals();

    // __tv_utf8_encode_native(text) -> byte array
    globals.set(
        "__tv_utf8_encode_native",
        Func::from(|text: String| -> Vec<u8> { text.into_bytes() }),
    )?;

    // __tv_utf8_decode_native(bytes) -> string
    globals.set(
        "__tv_utf8_decode_native",
        Func::from(|value: Value| -> String {
            let json = opt_value_to_json(Some(&value));
            decode_byte_tree(&json)
        }),
    )?;

    // __tv_url_parse_native(url, base?) -> parts object | null
    globals.set(
        "__tv_url_parse_native",
        Func::from(
            |ctx: Ctx<'_>, url: String, base: Opt<Value>| -> rquickjs::Result<Value> {
                let base = base
                    .0
                    .as_ref()
                    .and_then(Value::as_string)
                    .and_then(|s| s.to_string().ok());
                match parse_url_parts(&url, base.as_deref()) {
                    Some(parts) => json_to_js(&ctx, &parts),
                    None => Ok(Value::new_null(ctx.clone())),
                }
            },
        ),
    )?;

    // __tv_query_parse_native(query) -> { key: [values] }
    globals.set(
        "__tv_query_parse_native",
        Func::from(|ctx: Ctx<'_>, query: String| -> rquickjs::Result<Value> {
            json_to_js(&ctx, &parse_query(&query))
        }),
    )?;

    // __tv_query_encode_native([[key, value], ...]) -> string
    globals.set(
        "__tv_query_encode_native",
        Func::from(|entries: Value| -> String {
            let json = opt_value_to_json(Some(&entries));
            encode_query(&json)
        }),
    )?;

    Ok(())
}

/// Decode a numeric byte array (or an index-keyed object, the JSON shape of
/// a typed array) into a lossy UTF-8 string.
fn decode_byte_tree(value: &Json) -> String {
    let mut bytes: Vec<u8> = Vec::new();
    match value {
        Json::Array(items) => {
            bytes.extend(
                items
                    .iter()
                    .filter_map(Json::as_f64)
                    .map(|n| n as i64 as u8),
            );
        }
        Json::Object(map) => {
            let mut index = 0_usize;
            while let Some(item) = map.get(&index.to_string()) {
                if let Some(n) = item.as_f64() {
                    bytes.push(n as i64 as u8);
                }
                index += 1;
            }
        }
        Json::String(text) => return text.clone(),
        _ => {}
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

fn parse_url_parts(url: &str, base: Option<&str>) -> Option<Json> {
    let parsed = match base {
        Some(base) => Url::parse(base).ok()?.join(url).ok()?,
        None => Url::parse(url).ok()?,
    };

    let hostname = parsed.host_str().unwrap_or("");
    let host = match parsed.port() {
        Some(port) => format!("{hostname}:{port}"),
        None => hostname.to_string(),
    };

    let mut query: serde_json::Map<String, Json> = serde_json::Map::new();
    for (key, value) in parsed.query_pairs() {
        if let Some(values) = query
            .entry(key.into_owned())
            .or_insert_with(|| Json::Array(Vec::new()))
            .as_array_mut()
        {
            values.push(Json::String(value.into_owned()));
        }
    }

    Some(serde_json::json!({
        "href": parsed.as_str(),
        "protocol": format!("{}:", parsed.scheme()),
        "host": host,
        "hostname": hostname,
        "port": parsed.port().map(|p| p.to_string()).unwrap_or_default(),
        "pathname": parsed.path(),
        "search": parsed.query().map(|q| format!("?{q}")).unwrap_or_default(),
        "hash": parsed.fragment().map(|f| format!("#{f}")).unwrap_or_default(),
        "origin": format!("{}://{host}", parsed.scheme()),
        "username": parsed.username(),
        "password": parsed.password().unwrap_or(""),
        "query": Json::Object(query),
    }))
}

fn parse_query(query: &str) -> Json {
    let query = query.strip_prefix('?').unwrap_or(query);
    let mut out: serde_json::Map<String, Json> = serde_json::Map::new();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        if let Some(values) = out
            .entry(key.into_owned())
            .or_insert_with(|| Json::Array(Vec::new()))
            .as_array_mut()
        {
            values.push(Json::String(value.into_owned()));
        }
    }
    Json::Object(out)
}

/// Encode `[[key, value], ...]` pairs, sorted by key for a stable output.
fn encode_query(entries: &Json) -> String {
    let mut pairs: Vec<(String, String)> = entries
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|entry| {
                    let pair = entry.as_array()?;
                    let key = pair.first()?.as_str()?.to_string();
                    let value = pair.get(1)?.as_str()?.to_string();
                    Some((key, value))
                })
                .collect()
        })
        .unwrap_or_default();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in &pairs {
        serializer.append_pair(key, value);
    }
    serializer.finish()
}

// ---------------------------------------------------------------------------
// JS classes over the natives
// ---------------------------------------------------------------------------

const POLYFILL_JS: &str = r#"
class TextEncoder {
  constructor() { this.encoding = 'utf-8'; }
  encode(input) {
    return __tv_utf8_encode_native(input === undefined ? '' : String(input));
  }
  encodeInto(source, destination) {
    var bytes = this.encode(source);
    return { read: String(source).length, written: bytes.length };
  }
}

class TextDecoder {
  constructor(label) {
    this.encoding = label || 'utf-8';
    this.fatal = false;
    this.ignoreBOM = false;
  }
  decode(input) {
    if (input === undefined) return '';
    return __tv_utf8_decode_native(input);
  }
}

class URLSearchParams {
  constructor(init) {
    this._entries = [];
    if (typeof init === 'string') {
      var parsed = __tv_query_parse_native(init);
      for (var key in parsed) {
        for (var i = 0; i < parsed[key].length; i++) {
          this._entries.push([key, parsed[key][i]]);
        }
      }
    } else if (init && typeof init === 'object') {
      for (var name in init) {
        this._entries.push([name, String(init[name])]);
      }
    }
  }
  append(key, value) { this._entries.push([String(key), String(value)]); }
  delete(key) {
    this._entries = this._entries.filter(function (e) { return e[0] !== key; });
  }
  get(key) {
    for (var i = 0; i < this._entries.length; i++) {
      if (this._entries[i][0] === key) return this._entries[i][1];
    }
    return null;
  }
  getAll(key) {
    return this._entries
      .filter(function (e) { return e[0] === key; })
      .map(function (e) { return e[1]; });
  }
  has(key) {
    return this._entries.some(function (e) { return e[0] === key; });
  }
  set(key, value) {
    this.delete(key);
    this.append(key, value);
  }
  toString() { return __tv_query_encode_native(this._entries); }
}

class URL {
  constructor(url, base) {
    var parsed = __tv_url_parse_native(
      String(url),
      base === undefined ? undefined : String(base)
    );
    if (!parsed) {
      this.href = String(url);
      this.protocol = '';
      this.host = '';
      this.hostname = '';
      this.port = '';
      this.pathname = '';
      this.search = '';
      this.hash = '';
      this.origin = '';
      this.username = '';
      this.password = '';
      this.searchParams = new URLSearchParams('');
      return;
    }
    this.href = parsed.href;
    this.protocol = parsed.protocol;
    this.host = parsed.host;
    this.hostname = parsed.hostname;
    this.port = parsed.port;
    this.pathname = parsed.pathname;
    this.search = parsed.search;
    this.hash = parsed.hash;
    this.origin = parsed.origin;
    this.username = parsed.username;
    this.password = parsed.password;
    this.searchParams = new URLSearchParams(parsed.search);
  }
  toString() { return this.href; }
  toJSON() { return this.href; }
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_parts() {
        let parts =
            parse_url_parts("https://user:pw@example.com:8443/a/b?x=1&x=2&y=z#frag", None)
                .unwrap();
        assert_eq!(parts["protocol"], serde_json::json!("https:"));
        assert_eq!(parts["host"], serde_json::json!("example.com:8443"));
        assert_eq!(parts["hostname"], serde_json::json!("example.com"));
        assert_eq!(parts["port"], serde_json::json!("8443"));
        assert_eq!(parts["pathname"], serde_json::json!("/a/b"));
        assert_eq!(parts["search"], serde_json::json!("?x=1&x=2&y=z"));
        assert_eq!(parts["hash"], serde_json::json!("#frag"));
        assert_eq!(parts["origin"], serde_json::json!("https://example.com:8443"));
        assert_eq!(parts["username"], serde_json::json!("user"));
        assert_eq!(parts["password"], serde_json::json!("pw"));
        assert_eq!(parts["query"]["x"], serde_json::json!(["1", "2"]));
    }

    #[test]
    fn url_with_base() {
        let parts = parse_url_parts("/path?q=1", Some("https://example.com/other")).unwrap();
        assert_eq!(parts["href"], serde_json::json!("https://example.com/path?q=1"));
        assert!(parse_url_parts(":// nope", None).is_none());
    }

    #[test]
    fn query_parse_and_encode() {
        let parsed = parse_query("?b=2&a=1&a=3");
        assert_eq!(parsed["a"], serde_json::json!(["1", "3"]));
        assert_eq!(parsed["b"], serde_json::json!(["2"]));

        let encoded = encode_query(&serde_json::json!([["b", "2"], ["a", "1 z"]]));
        // Sorted by key, form-encoded.
        assert_eq!(encoded, "a=1+z&b=2");
    }

    #[test]
    fn byte_tree_decoding() {
        assert_eq!(decode_byte_tree(&serde_json::json!([104, 105])), "hi");
        assert_eq!(
            decode_byte_tree(&serde_json::json!({"0": 104, "1": 105})),
            "hi"
        );
        assert_eq!(decode_byte_tree(&serde_json::json!("already text")), "already text");
        assert_eq!(decode_byte_tree(&serde_json::json!(null)), "");
    }
}
