//! General-purpose utilities (`utils.*`): base64, digests, JSON helpers,
//! and a blocking sleep.

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine as _;
use md5::Md5;
use rquickjs::function::Func;
use rquickjs::{Ctx, Object, Value};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::debug;

pub(crate) fn hex_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Standard base64 decode with a URL-safe fallback; empty string on failure.
pub(crate) fn base64_decode_lenient(input: &str) -> String {
    let decoded = STANDARD
        .decode(input)
        .or_else(|_| URL_SAFE.decode(input));
    match decoded {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(err) => {
            debug!("base64 decode error: {err}");
            String::new()
        }
    }
}

pub(crate) fn register(ctx: &Ctx<'_>) -> rquickjs::Result<()> {
    let utils = Object::new(ctx.clone())?;

    utils.set(
        "base64Encode",
        Func::from(|input: String| -> String { STANDARD.encode(input.as_bytes()) }),
    )?;

    utils.set(
        "base64Decode",
        Func::from(|input: String| -> String { base64_decode_lenient(&input) }),
    )?;

    utils.set(
        "md5",
        Func::from(|input: String| -> String {
            hex_lower(&Md5::digest(input.as_bytes()))
        }),
    )?;

    utils.set(
        "sha1",
        Func::from(|input: String| -> String {
            hex_lower(&Sha1::digest(input.as_bytes()))
        }),
    )?;

    utils.set(
        "sha256",
        Func::from(|input: String| -> String {
            hex_lower(&Sha256::digest(input.as_bytes()))
        }),
    )?;

    utils.set(
        "parseJSON",
        Func::from(|ctx: Ctx<'_>, text: String| -> rquickjs::Result<Value> {
            match serde_json::from_str::<serde_json::Value>(&text) {
                Ok(value) => crate::runtime::json_to_js(&ctx, &value),
                Err(_) => Ok(Value::new_undefined(ctx.clone())),
            }
        }),
    )?;

    utils.set(
        "stringifyJSON",
        Func::from(|value: Value| -> String {
            crate::runtime::js_to_json(&value)
                .ok()
                .and_then(|json| serde_json::to_string(&json).ok())
                .unwrap_or_default()
        }),
    )?;

    utils.set(
        "sleep",
        Func::from(|ms: f64| {
            std::thread::sleep(Duration::from_millis(ms.max(0.0) as u64));
        }),
    )?;

    ctx.globals().set("utils", utils)?;
    Ok(())
}
