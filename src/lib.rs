//! TuneVault extension host.
//!
//! Runs untrusted JavaScript extensions for an audio download/tag/catalogue
//! application inside per-extension QuickJS sandboxes. Each runtime exposes a
//! curated host API (HTTP, files, storage, encrypted credentials, OAuth with
//! PKCE, a post-processing command queue, matching utilities, and browser
//! polyfills) behind capability gates: a manifest-driven domain allow-list
//! with private-address blocking, a data-directory path sandbox with a
//! download allow-list, and a hard execution timeout.
//!
//! The host application embeds this crate, loads extensions with
//! [`LoadedExtension::load`], runs them through [`ExtensionRuntime`], and
//! services cross-boundary signals (auth handoffs, post-processing commands,
//! duplicate checks) via a shared [`HostServices`] value.

#![forbid(unsafe_code)]
#![allow(
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions
)]

pub mod duplicate;
pub mod error;
pub mod extension;
pub mod http_util;
pub mod manifest;
pub mod netguard;
pub mod probe;
pub mod ratelimit;
pub mod runtime;
pub mod runtime_auth;
pub mod runtime_ffmpeg;
pub mod runtime_file;
pub mod runtime_http;
pub mod runtime_matching;
pub mod runtime_polyfills;
pub mod runtime_storage;
pub mod runtime_utils;
pub mod services;
pub mod timeout;

pub use error::{Error, Result};
pub use extension::LoadedExtension;
pub use manifest::{ExtensionManifest, ExtensionPermissions};
pub use runtime::ExtensionRuntime;
pub use services::{ExtensionAuthState, FfmpegCommand, HostServices, PendingAuthRequest};
