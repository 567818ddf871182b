//! Sandboxed file API (`file.*`) and the path gate.
//!
//! Every operation routes its path arguments through [`ApiState::validate_path`]:
//! relative paths resolve under the extension's data directory and must stay
//! there; absolute paths are admitted only under the process-wide download
//! allow-list; everything requires the manifest's `file` permission.

use crate::error::{Error, Result};
use crate::http_util::{DEFAULT_USER_AGENT, DOWNLOAD_TIMEOUT};
use crate::netguard;
use crate::runtime::{failure_value, json_to_js, ApiState};
use crate::services::normalize_path;
use rquickjs::function::{Func, Opt};
use rquickjs::{Ctx, Function, Object, Value};
use serde_json::Value as Json;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

const DOWNLOAD_CHUNK: usize = 32 * 1024;

impl ApiState {
    /// The path gate. Returns the final absolute path on success.
    pub(crate) fn validate_path(&self, raw: &str) -> Result<PathBuf> {
        if !self.extension.manifest.permissions.file {
            return Err(Error::permission(
                "file access denied: extension does not have 'file' permission",
            ));
        }

        let clean = normalize_path(Path::new(raw));

        if clean.is_absolute() {
            if self.services.is_path_in_allowed_dirs(&clean) {
                return Ok(clean);
            }
            return Err(Error::sandbox(
                "file access denied: absolute paths are not allowed. \
                 Use relative paths within extension sandbox",
            ));
        }

        let full = normalize_path(&self.extension.data_dir.join(clean));
        if !full.starts_with(&self.extension.data_dir) {
            return Err(Error::sandbox(format!(
                "file access denied: path '{raw}' is outside sandbox"
            )));
        }
        Ok(full)
    }

    pub(crate) fn file_read(&self, path: &str) -> Json {
        match self.validate_path(path).and_then(|full| {
            std::fs::read_to_string(&full).map_err(Error::from)
        }) {
            Ok(data) => serde_json::json!({ "success": true, "data": data }),
            Err(err) => failure_value(err.to_string()),
        }
    }

    pub(crate) fn file_write(&self, path: &str, data: &str) -> Json {
        let full = match self.validate_path(path) {
            Ok(full) => full,
            Err(err) => return failure_value(err.to_string()),
        };
        if let Err(err) = write_file(&full, data.as_bytes(), 0o644) {
            return failure_value(err.to_string());
        }
        serde_json::json!({ "success": true, "path": full })
    }

    pub(crate) fn file_delete(&self, path: &str) -> Json {
        match self
            .validate_path(path)
            .and_then(|full| std::fs::remove_file(full).map_err(Error::from))
        {
            Ok(()) => serde_json::json!({ "success": true }),
            Err(err) => failure_value(err.to_string()),
        }
    }

    pub(crate) fn file_exists(&self, path: &str) -> bool {
        self.validate_path(path)
            .map(|full| full.exists())
            .unwrap_or(false)
    }

    pub(crate) fn file_size(&self, path: &str) -> Json {
        match self
            .validate_path(path)
            .and_then(|full| std::fs::metadata(full).map_err(Error::from))
        {
            Ok(meta) => serde_json::json!({ "success": true, "size": meta.len() }),
            Err(err) => failure_value(err.to_string()),
        }
    }

    pub(crate) fn file_copy(&self, src: &str, dst: &str) -> Json {
        let full_src = match self.validate_path(src) {
            Ok(path) => path,
            Err(err) => return failure_value(err.to_string()),
        };
        let full_dst = match self.validate_path(dst) {
            Ok(path) => path,
            Err(err) => return failure_value(err.to_string()),
        };

        let data = match std::fs::read(&full_src) {
            Ok(data) => data,
            Err(err) => return failure_value(format!("failed to read source: {err}")),
        };
        if let Err(err) = write_file(&full_dst, &data, 0o644) {
            return failure_value(format!("failed to write destination: {err}"));
        }
        serde_json::json!({ "success": true, "path": full_dst })
    }

    pub(crate) fn file_move(&self, src: &str, dst: &str) -> Json {
        let full_src = match self.validate_path(src) {
            Ok(path) => path,
            Err(err) => return failure_value(err.to_string()),
        };
        let full_dst = match self.validate_path(dst) {
            Ok(path) => path,
            Err(err) => return failure_value(err.to_string()),
        };

        if let Err(err) = ensure_parent_dir(&full_dst) {
            return failure_value(format!("failed to create directory: {err}"));
        }
        if let Err(err) = std::fs::rename(&full_src, &full_dst) {
            return failure_value(format!("failed to move file: {err}"));
        }
        serde_json::json!({ "success": true, "path": full_dst })
    }
}

fn ensure_parent_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt as _;
            let _ = std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o755));
        }
    }
    Ok(())
}

fn write_file(path: &Path, data: &[u8], mode: u32) -> std::io::Result<()> {
    ensure_parent_dir(path)?;
    std::fs::write(path, data)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    {
        let _ = mode;
    }
    Ok(())
}

/// Streamed download with optional progress callback. The callback fires per
/// chunk only when the server reported a content length.
fn download<'js>(
    state: &ApiState,
    url: &str,
    output: &str,
    options: Option<Value<'js>>,
) -> Json {
    if let Err(err) = netguard::validate_domain(&state.extension.manifest, url) {
        return failure_value(err.to_string());
    }
    let full_path = match state.validate_path(output) {
        Ok(path) => path,
        Err(err) => return failure_value(err.to_string()),
    };

    let mut on_progress: Option<Function<'js>> = None;
    let mut headers = Json::Null;
    if let Some(options) = options.as_ref().and_then(Value::as_object) {
        on_progress = options
            .get::<_, Option<Function>>("onProgress")
            .ok()
            .flatten();
        if let Ok(Some(header_value)) = options.get::<_, Option<Value>>("headers") {
            headers = crate::runtime::opt_value_to_json(Some(&header_value));
        }
    }

    let client = match state.http_client() {
        Ok(client) => client,
        Err(err) => return failure_value(err.to_string()),
    };

    let mut request = client.get(url).timeout(DOWNLOAD_TIMEOUT);
    let mut has_user_agent = false;
    if let Some(map) = headers.as_object() {
        for (name, value) in map {
            if name.eq_ignore_ascii_case("user-agent") {
                has_user_agent = true;
            }
            request = request.header(name.as_str(), crate::runtime_http::json_scalar_to_string(value));
        }
    }
    if !has_user_agent {
        request = request.header("User-Agent", DEFAULT_USER_AGENT);
    }

    let mut response = match request.send() {
        Ok(response) => response,
        Err(err) => return failure_value(err.to_string()),
    };
    if response.status().as_u16() != 200 {
        return failure_value(format!("HTTP error: {}", response.status().as_u16()));
    }
    let content_length = response.content_length().unwrap_or(0);

    if let Err(err) = ensure_parent_dir(&full_path) {
        return failure_value(format!("failed to create directory: {err}"));
    }
    let mut out = match std::fs::File::create(&full_path) {
        Ok(file) => file,
        Err(err) => return failure_value(format!("failed to create file: {err}")),
    };

    let mut written: u64 = 0;
    let mut buf = vec![0_u8; DOWNLOAD_CHUNK];
    loop {
        let read = match response.read(&mut buf) {
            Ok(read) => read,
            Err(err) => return failure_value(format!("failed to read response: {err}")),
        };
        if read == 0 {
            break;
        }
        if let Err(err) = out.write_all(&buf[..read]) {
            return failure_value(format!("failed to write file: {err}"));
        }
        written += read as u64;

        if content_length > 0 {
            if let Some(callback) = on_progress.as_ref() {
                let _ = callback.call::<_, ()>((written as f64, content_length as f64));
            }
        }
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        let _ = std::fs::set_permissions(&full_path, std::fs::Permissions::from_mode(0o644));
    }

    debug!(
        extension = %state.extension.id,
        bytes = written,
        path = %full_path.display(),
        "download complete"
    );

    serde_json::json!({ "success": true, "path": full_path, "size": written })
}

pub(crate) fn register(ctx: &Ctx<'_>, state: &Arc<ApiState>) -> rquickjs::Result<()> {
    let file = Object::new(ctx.clone())?;

    let st = Arc::clone(state);
    file.set(
        "download",
        Func::from(crate::runtime::constrain3(
            move |ctx: Ctx<'_>,
                  url: String,
                  output: String,
                  options: Opt<Value>|
                  -> rquickjs::Result<Value> {
                let result = download(&st, &url, &output, options.0);
                json_to_js(&ctx, &result)
            },
        )),
    )?;

    let st = Arc::clone(state);
    file.set(
        "read",
        Func::from(crate::runtime::constrain1(
            move |ctx: Ctx<'_>, path: String| -> rquickjs::Result<Value> {
                json_to_js(&ctx, &st.file_read(&path))
            },
        )),
    )?;

    let st = Arc::clone(state);
    file.set(
        "write",
        Func::from(crate::runtime::constrain2(
            move |ctx: Ctx<'_>, path: String, data: String| -> rquickjs::Result<Value> {
                json_to_js(&ctx, &st.file_write(&path, &data))
            },
        )),
    )?;

    let st = Arc::clone(state);
    file.set(
        "delete",
        Func::from(crate::runtime::constrain1(
            move |ctx: Ctx<'_>, path: String| -> rquickjs::Result<Value> {
                json_to_js(&ctx, &st.file_delete(&path))
            },
        )),
    )?;

    let st = Arc::clone(state);
    file.set(
        "exists",
        Func::from(move |path: String| -> bool { st.file_exists(&path) }),
    )?;

    let st = Arc::clone(state);
    file.set(
        "getSize",
        Func::from(crate::runtime::constrain1(
            move |ctx: Ctx<'_>, path: String| -> rquickjs::Result<Value> {
                json_to_js(&ctx, &st.file_size(&path))
            },
        )),
    )?;

    let st = Arc::clone(state);
    file.set(
        "copy",
        Func::from(crate::runtime::constrain2(
            move |ctx: Ctx<'_>, src: String, dst: String| -> rquickjs::Result<Value> {
                json_to_js(&ctx, &st.file_copy(&src, &dst))
            },
        )),
    )?;

    let st = Arc::clone(state);
    file.set(
        "move",
        Func::from(crate::runtime::constrain2(
            move |ctx: Ctx<'_>, src: String, dst: String| -> rquickjs::Result<Value> {
                json_to_js(&ctx, &st.file_move(&src, &dst))
            },
        )),
    )?;

    ctx.globals().set("file", file)?;
    Ok(())
}
