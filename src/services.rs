//! Shared host services.
//!
//! All cross-boundary signalling between extension runtimes and the outer
//! application flows through one injectable [`HostServices`] value: OAuth
//! state and pending auth handoffs, the FFmpeg command queue, the download
//! allow-list, the proxy configuration, and the ISRC duplicate index. Each
//! map is internally synchronized; readers never hold a lock across I/O.
//! Tests instantiate a fresh `HostServices` per case.

use crate::duplicate::{IsrcIndexStore, TrackExistence, TrackQuery};
use crate::error::Result;
use crate::http_util::{self, ProxyConfig, ProxyKind, ProxyState};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info};

/// Per-extension OAuth state, external to any HTTP exchange.
#[derive(Debug, Clone, Default)]
pub struct ExtensionAuthState {
    pub pending_auth_url: String,
    pub auth_code: String,
    pub pkce_verifier: String,
    pub pkce_challenge: String,
    pub access_token: String,
    pub refresh_token: String,
    pub is_authenticated: bool,
    /// Absolute expiry instant; `None` = unknown.
    pub expires_at: Option<SystemTime>,
}

impl ExtensionAuthState {
    /// Authenticated and, when an expiry is known, not yet past it.
    pub fn is_currently_authenticated(&self) -> bool {
        if !self.is_authenticated {
            return false;
        }
        match self.expires_at {
            Some(expires_at) => SystemTime::now() < expires_at,
            None => true,
        }
    }
}

/// An auth handoff awaiting the outer application.
#[derive(Debug, Clone)]
pub struct PendingAuthRequest {
    pub extension_id: String,
    pub auth_url: String,
    pub callback_url: String,
}

/// A queued post-processing command, keyed by an opaque id.
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    pub extension_id: String,
    pub command: String,
    pub input_path: String,
    pub output_path: String,
    pub completed: bool,
    pub success: bool,
    pub output: String,
    pub error: String,
}

#[derive(Debug, Default)]
struct FfmpegQueueState {
    commands: HashMap<String, FfmpegCommand>,
    next_id: u64,
}

#[derive(Debug, Default)]
struct FfmpegQueue {
    state: Mutex<FfmpegQueueState>,
    completed: Condvar,
}

/// The shared services hub. One per host process (or per test).
#[derive(Debug, Default)]
pub struct HostServices {
    auth: RwLock<HashMap<String, ExtensionAuthState>>,
    pending_auth: RwLock<HashMap<String, PendingAuthRequest>>,
    ffmpeg: FfmpegQueue,
    allowed_download_dirs: RwLock<Vec<PathBuf>>,
    proxy: ProxyState,
    isrc: IsrcIndexStore,
}

impl HostServices {
    pub fn new() -> Self {
        Self::default()
    }

    // -----------------------------------------------------------------------
    // Auth state
    // -----------------------------------------------------------------------

    /// Snapshot of an extension's auth state (default when absent).
    pub fn auth_state(&self, extension_id: &str) -> ExtensionAuthState {
        self.auth
            .read()
            .get(extension_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Mutate an extension's auth state, creating it on first use.
    pub(crate) fn with_auth_state<T>(
        &self,
        extension_id: &str,
        apply: impl FnOnce(&mut ExtensionAuthState) -> T,
    ) -> T {
        let mut auth = self.auth.write();
        let state = auth.entry(extension_id.to_string()).or_default();
        apply(state)
    }

    /// Deliver an auth code (or a full token object) from the outer app.
    ///
    /// Accepts either a bare code string or an object with `code`,
    /// `access_token`, `refresh_token`, `expires_in` fields.
    pub fn set_auth_code(&self, extension_id: &str, value: &serde_json::Value) {
        self.with_auth_state(extension_id, |state| match value {
            serde_json::Value::String(code) => state.auth_code = code.clone(),
            serde_json::Value::Object(fields) => {
                if let Some(code) = fields.get("code").and_then(|v| v.as_str()) {
                    state.auth_code = code.to_string();
                }
                if let Some(token) = fields.get("access_token").and_then(|v| v.as_str()) {
                    state.access_token = token.to_string();
                    state.is_authenticated = true;
                }
                if let Some(token) = fields.get("refresh_token").and_then(|v| v.as_str()) {
                    state.refresh_token = token.to_string();
                }
                if let Some(expires_in) = fields.get("expires_in").and_then(|v| v.as_f64()) {
                    state.expires_at =
                        Some(SystemTime::now() + Duration::from_secs_f64(expires_in.max(0.0)));
                }
            }
            _ => {}
        });
    }

    /// Whether the extension currently holds unexpired credentials.
    pub fn is_authenticated(&self, extension_id: &str) -> bool {
        self.auth
            .read()
            .get(extension_id)
            .is_some_and(ExtensionAuthState::is_currently_authenticated)
    }

    /// Remove all auth state and any pending handoff for an extension.
    pub fn clear_auth(&self, extension_id: &str) {
        self.auth.write().remove(extension_id);
        self.pending_auth.write().remove(extension_id);
        debug!(extension = %extension_id, "auth state cleared");
    }

    pub(crate) fn put_pending_auth_request(&self, request: PendingAuthRequest) {
        self.pending_auth
            .write()
            .insert(request.extension_id.clone(), request);
    }

    /// Consume the pending auth handoff for an extension (read + delete).
    pub fn take_pending_auth_request(&self, extension_id: &str) -> Option<PendingAuthRequest> {
        self.pending_auth.write().remove(extension_id)
    }

    // -----------------------------------------------------------------------
    // FFmpeg command queue
    // -----------------------------------------------------------------------

    /// Queue a command and return its opaque id (`"{extension_id}_{n}"`).
    pub(crate) fn enqueue_ffmpeg_command(
        &self,
        extension_id: &str,
        command: &str,
        input_path: &str,
        output_path: &str,
    ) -> String {
        let mut state = self.ffmpeg.state.lock();
        state.next_id += 1;
        let id = format!("{extension_id}_{}", state.next_id);
        state.commands.insert(
            id.clone(),
            FfmpegCommand {
                extension_id: extension_id.to_string(),
                command: command.to_string(),
                input_path: input_path.to_string(),
                output_path: output_path.to_string(),
                completed: false,
                success: false,
                output: String::new(),
                error: String::new(),
            },
        );
        debug!(extension = %extension_id, command_id = %id, "ffmpeg command queued");
        id
    }

    /// Block until the outer app completes the command or `timeout` elapses.
    /// The queue entry is removed either way.
    pub(crate) fn wait_for_ffmpeg_result(
        &self,
        command_id: &str,
        timeout: Duration,
    ) -> Option<FfmpegCommand> {
        let deadline = Instant::now() + timeout;
        let mut state = self.ffmpeg.state.lock();
        loop {
            match state.commands.get(command_id) {
                Some(command) if command.completed => {
                    return state.commands.remove(command_id);
                }
                Some(_) => {}
                None => return None,
            }

            let now = Instant::now();
            if now >= deadline {
                state.commands.remove(command_id);
                return None;
            }
            // Wake on completion, or at least every poll interval.
            let wait = (deadline - now).min(Duration::from_millis(100));
            self.ffmpeg.completed.wait_for(&mut state, wait);
        }
    }

    /// Look up a queued command by id (outer-app side).
    pub fn get_pending_ffmpeg_command(&self, command_id: &str) -> Option<FfmpegCommand> {
        self.ffmpeg.state.lock().commands.get(command_id).cloned()
    }

    /// All commands still awaiting a result (outer-app side).
    pub fn pending_ffmpeg_commands(&self) -> Vec<(String, FfmpegCommand)> {
        self.ffmpeg
            .state
            .lock()
            .commands
            .iter()
            .filter(|(_, command)| !command.completed)
            .map(|(id, command)| (id.clone(), command.clone()))
            .collect()
    }

    /// Record the result of a command and wake the waiting runtime.
    pub fn set_ffmpeg_command_result(
        &self,
        command_id: &str,
        success: bool,
        output: &str,
        error: &str,
    ) {
        let mut state = self.ffmpeg.state.lock();
        if let Some(command) = state.commands.get_mut(command_id) {
            command.completed = true;
            command.success = success;
            command.output = output.to_string();
            command.error = error.to_string();
        }
        drop(state);
        self.ffmpeg.completed.notify_all();
    }

    /// Drop a queue entry without delivering a result.
    pub fn clear_ffmpeg_command(&self, command_id: &str) {
        self.ffmpeg.state.lock().commands.remove(command_id);
    }

    // -----------------------------------------------------------------------
    // Download allow-list
    // -----------------------------------------------------------------------

    /// Replace the absolute roots under which extensions may write via
    /// absolute paths.
    pub fn set_allowed_download_dirs(&self, dirs: Vec<PathBuf>) {
        let normalized: Vec<PathBuf> = dirs.iter().map(|d| normalize_path(d)).collect();
        info!(dirs = ?normalized, "allowed download directories set");
        *self.allowed_download_dirs.write() = normalized;
    }

    pub fn add_allowed_download_dir(&self, dir: &Path) {
        self.allowed_download_dirs
            .write()
            .push(normalize_path(dir));
    }

    /// Whether `path` lies under one of the configured allow-list roots.
    /// Comparison is component-wise, so `/music` does not cover `/music2`.
    pub fn is_path_in_allowed_dirs(&self, path: &Path) -> bool {
        let path = normalize_path(path);
        self.allowed_download_dirs
            .read()
            .iter()
            .any(|root| path.starts_with(root))
    }

    // -----------------------------------------------------------------------
    // Proxy
    // -----------------------------------------------------------------------

    /// Configure the process-wide proxy. `kind` is one of `http`, `https`,
    /// `socks5`. Credentials are held in memory and never logged.
    pub fn set_proxy_configuration(
        &self,
        kind: &str,
        host: &str,
        port: u16,
        username: &str,
        password: &str,
    ) -> Result<()> {
        let kind = ProxyKind::parse(kind)?;
        self.proxy.set(ProxyConfig {
            kind,
            host: host.to_string(),
            port,
            username: username.to_string(),
            password: password.to_string(),
        });
        Ok(())
    }

    pub fn clear_proxy_configuration(&self) {
        self.proxy.clear();
    }

    /// Monotonic counter bumped on every proxy change; clients cache it to
    /// know when to rebuild.
    pub(crate) fn proxy_generation(&self) -> u64 {
        self.proxy.generation()
    }

    /// Build a pooled blocking client honoring the current proxy.
    pub(crate) fn build_http_client(
        &self,
        timeout: Duration,
    ) -> Result<reqwest::blocking::Client> {
        http_util::build_client(self.proxy.snapshot().as_ref(), timeout)
    }

    // -----------------------------------------------------------------------
    // ISRC duplicate index
    // -----------------------------------------------------------------------

    /// Eagerly build the ISRC index for a directory.
    pub fn pre_build_isrc_index(&self, output_dir: &Path) {
        self.isrc.pre_build(output_dir);
    }

    /// Fast duplicate check; returns the indexed path when a live file with
    /// this ISRC exists under `output_dir`.
    pub fn check_isrc_exists(&self, output_dir: &Path, isrc: &str) -> Option<PathBuf> {
        self.isrc.check_exists(output_dir, isrc)
    }

    pub fn invalidate_isrc_cache(&self, output_dir: &Path) {
        self.isrc.invalidate(output_dir);
    }

    pub fn add_to_isrc_index(&self, output_dir: &Path, isrc: &str, path: PathBuf) {
        self.isrc.add(output_dir, isrc, path);
    }

    /// Batch duplicate check for a track list.
    pub fn check_tracks_exist(
        &self,
        output_dir: &Path,
        tracks: &[TrackQuery],
    ) -> Vec<TrackExistence> {
        self.isrc.check_tracks_exist(output_dir, tracks)
    }
}

/// Lexically normalize a path: fold `.` and `..` without touching the
/// filesystem.
pub(crate) fn normalize_path(path: &Path) -> PathBuf {
    let absolute = path.is_absolute();
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let can_pop = matches!(out.components().next_back(), Some(Component::Normal(_)));
                if can_pop {
                    out.pop();
                } else if !absolute {
                    // A relative path keeps its leading `..` components so an
                    // escape stays visible to the caller.
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
