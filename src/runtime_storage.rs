//! Plaintext storage (`storage.*`) and encrypted credentials
//! (`credentials.*`).
//!
//! Storage is a single indented JSON object per extension
//! (`<data_dir>/storage.json`). Credentials are sealed with AES-256-GCM into
//! `.credentials.enc` as `nonce(12) || ciphertext`, keyed by
//! SHA-256(extension_id || salt) where the 32-byte salt (`.cred_salt`)
//! is generated once per installation. The salt makes the key
//! installation-unique, so a leaked extension id cannot decrypt another
//! device's store. Corrupted ciphertext fails loudly; there is no plaintext
//! fallback.

use crate::error::{Error, Result};
use crate::runtime::{failure_value, json_to_js, js_to_json, ApiState};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use rquickjs::function::{Func, Opt};
use rquickjs::{Ctx, Object, Value};
use serde_json::Value as Json;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

const STORAGE_FILE: &str = "storage.json";
const CREDENTIALS_FILE: &str = ".credentials.enc";
const SALT_FILE: &str = ".cred_salt";
const SALT_LEN: usize = 32;
const NONCE_LEN: usize = 12;

type JsonMap = serde_json::Map<String, Json>;

impl ApiState {
    // -----------------------------------------------------------------------
    // Storage
    // -----------------------------------------------------------------------

    fn storage_path(&self) -> PathBuf {
        self.extension.data_dir.join(STORAGE_FILE)
    }

    fn load_storage(&self) -> Result<JsonMap> {
        load_json_map(&self.storage_path())
    }

    fn save_storage(&self, storage: &JsonMap) -> Result<()> {
        let data = serde_json::to_string_pretty(&Json::Object(storage.clone()))?;
        write_private(&self.storage_path(), data.as_bytes(), 0o644)
    }

    pub(crate) fn storage_get(&self, key: &str) -> Option<Json> {
        match self.load_storage() {
            Ok(storage) => storage.get(key).cloned(),
            Err(err) => {
                warn!(extension = %self.extension.id, "storage load error: {err}");
                None
            }
        }
    }

    pub(crate) fn storage_set(&self, key: &str, value: Json) -> bool {
        let mut storage = match self.load_storage() {
            Ok(storage) => storage,
            Err(err) => {
                warn!(extension = %self.extension.id, "storage load error: {err}");
                return false;
            }
        };
        storage.insert(key.to_string(), value);
        match self.save_storage(&storage) {
            Ok(()) => true,
            Err(err) => {
                warn!(extension = %self.extension.id, "storage save error: {err}");
                false
            }
        }
    }

    pub(crate) fn storage_remove(&self, key: &str) -> bool {
        let mut storage = match self.load_storage() {
            Ok(storage) => storage,
            Err(_) => return false,
        };
        storage.remove(key);
        self.save_storage(&storage).is_ok()
    }

    // -----------------------------------------------------------------------
    // Credentials
    // -----------------------------------------------------------------------

    fn credentials_path(&self) -> PathBuf {
        self.extension.data_dir.join(CREDENTIALS_FILE)
    }

    fn salt_path(&self) -> PathBuf {
        self.extension.data_dir.join(SALT_FILE)
    }

    fn get_or_create_salt(&self) -> Result<Vec<u8>> {
        let path = self.salt_path();
        if let Ok(salt) = std::fs::read(&path) {
            if salt.len() == SALT_LEN {
                return Ok(salt);
            }
        }

        let mut salt = vec![0_u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        write_private(&path, &salt, 0o600)?;
        Ok(salt)
    }

    /// Key = SHA-256(extension_id || salt). The per-installation salt keeps
    /// the key unique across devices.
    fn encryption_key(&self) -> Result<[u8; 32]> {
        let salt = self.get_or_create_salt()?;
        let mut hasher = Sha256::new();
        hasher.update(self.extension.id.as_bytes());
        hasher.update(&salt);
        Ok(hasher.finalize().into())
    }

    fn load_credentials(&self) -> Result<JsonMap> {
        let path = self.credentials_path();
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(JsonMap::new());
            }
            Err(err) => return Err(err.into()),
        };

        let key = self.encryption_key()?;
        let plaintext = decrypt_aes_gcm(&data, &key)?;
        let value: Json = serde_json::from_slice(&plaintext)?;
        match value {
            Json::Object(map) => Ok(map),
            _ => Err(Error::crypto("credential store is not an object")),
        }
    }

    fn save_credentials(&self, credentials: &JsonMap) -> Result<()> {
        let plaintext = serde_json::to_vec(&Json::Object(credentials.clone()))?;
        let key = self.encryption_key()?;
        let sealed = encrypt_aes_gcm(&plaintext, &key)?;
        write_private(&self.credentials_path(), &sealed, 0o600)
    }

    pub(crate) fn credentials_store(&self, key: &str, value: Json) -> Json {
        let mut credentials = match self.load_credentials() {
            Ok(credentials) => credentials,
            Err(err) => {
                warn!(extension = %self.extension.id, "credentials load error: {err}");
                return failure_value(err.to_string());
            }
        };
        credentials.insert(key.to_string(), value);
        match self.save_credentials(&credentials) {
            Ok(()) => serde_json::json!({ "success": true }),
            Err(err) => {
                warn!(extension = %self.extension.id, "credentials save error: {err}");
                failure_value(err.to_string())
            }
        }
    }

    pub(crate) fn credentials_get(&self, key: &str) -> Result<Option<Json>> {
        let credentials = self.load_credentials()?;
        Ok(credentials.get(key).cloned())
    }

    pub(crate) fn credentials_remove(&self, key: &str) -> bool {
        let mut credentials = match self.load_credentials() {
            Ok(credentials) => credentials,
            Err(_) => return false,
        };
        credentials.remove(key);
        self.save_credentials(&credentials).is_ok()
    }

    pub(crate) fn credentials_has(&self, key: &str) -> bool {
        self.load_credentials()
            .map(|credentials| credentials.contains_key(key))
            .unwrap_or(false)
    }
}

fn load_json_map(path: &Path) -> Result<JsonMap> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(JsonMap::new()),
        Err(err) => return Err(err.into()),
    };
    let value: Json = serde_json::from_slice(&data)?;
    match value {
        Json::Object(map) => Ok(map),
        _ => Err(Error::validation("storage file is not a JSON object")),
    }
}

fn write_private(path: &Path, data: &[u8], mode: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
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

// ---------------------------------------------------------------------------
// AES-GCM
// ---------------------------------------------------------------------------

/// Seal `plaintext` as `nonce(12) || ciphertext` with a fresh random nonce.
pub(crate) fn encrypt_aes_gcm(plaintext: &[u8], key: &[u8; 32]) -> Result<Vec<u8>> {
    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|err| Error::crypto(err.to_string()))?;

    let mut nonce = [0_u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| Error::crypto("encryption failed"))?;

    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Open `nonce(12) || ciphertext`. Wrong key or tampered data fails loudly.
pub(crate) fn decrypt_aes_gcm(data: &[u8], key: &[u8; 32]) -> Result<Vec<u8>> {
    if data.len() < NONCE_LEN {
        return Err(Error::crypto("ciphertext too short"));
    }
    let (nonce, sealed) = data.split_at(NONCE_LEN);
    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|err| Error::crypto(err.to_string()))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| Error::crypto("failed to decrypt credentials: wrong key or tampered data"))
}

pub(crate) fn register(ctx: &Ctx<'_>, state: &Arc<ApiState>) -> rquickjs::Result<()> {
    let storage = Object::new(ctx.clone())?;

    let st = Arc::clone(state);
    storage.set(
        "get",
        Func::from(
            move |ctx: Ctx<'_>, key: String, default: Opt<Value>| -> rquickjs::Result<Value> {
                match st.storage_get(&key) {
                    Some(value) => json_to_js(&ctx, &value),
                    None => Ok(default
                        .0
                        .unwrap_or_else(|| Value::new_undefined(ctx.clone()))),
                }
            },
        ),
    )?;

    let st = Arc::clone(state);
    storage.set(
        "set",
        Func::from(move |key: String, value: Value| -> bool {
            let value = js_to_json(&value).unwrap_or(Json::Null);
            st.storage_set(&key, value)
        }),
    )?;

    let st = Arc::clone(state);
    storage.set(
        "remove",
        Func::from(move |key: String| -> bool { st.storage_remove(&key) }),
    )?;

    ctx.globals().set("storage", storage)?;

    let credentials = Object::new(ctx.clone())?;

    let st = Arc::clone(state);
    credentials.set(
        "store",
        Func::from(
            move |ctx: Ctx<'_>, key: String, value: Value| -> rquickjs::Result<Value> {
                let value = js_to_json(&value).unwrap_or(Json::Null);
                json_to_js(&ctx, &st.credentials_store(&key, value))
            },
        ),
    )?;

    let st = Arc::clone(state);
    credentials.set(
        "get",
        Func::from(
            move |ctx: Ctx<'_>, key: String, default: Opt<Value>| -> rquickjs::Result<Value> {
                match st.credentials_get(&key) {
                    Ok(Some(value)) => json_to_js(&ctx, &value),
                    Ok(None) => Ok(default
                        .0
                        .unwrap_or_else(|| Value::new_undefined(ctx.clone()))),
                    Err(err) => {
                        warn!(extension = %st.extension.id, "credentials load error: {err}");
                        Ok(Value::new_undefined(ctx.clone()))
                    }
                }
            },
        ),
    )?;

    let st = Arc::clone(state);
    credentials.set(
        "remove",
        Func::from(move |key: String| -> bool { st.credentials_remove(&key) }),
    )?;

    let st = Arc::clone(state);
    credentials.set(
        "has",
        Func::from(move |key: String| -> bool { st.credentials_has(&key) }),
    )?;

    ctx.globals().set("credentials", credentials)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ExtensionPermissions;
    use crate::runtime::test_support::test_extension;
    use crate::runtime::ExtensionRuntime;
    use crate::services::HostServices;

    fn api_state() -> Arc<ApiState> {
        let runtime = ExtensionRuntime::new(
            test_extension(ExtensionPermissions {
                network: vec![],
                file: true,
                storage: true,
            }),
            Arc::new(HostServices::new()),
        )
        .unwrap();
        Arc::clone(&runtime.state)
    }

    #[test]
    fn storage_roundtrip_and_pretty_file() {
        let state = api_state();
        assert!(state.storage_set("count", serde_json::json!(3)));
        assert!(state.storage_set("nested", serde_json::json!({"a": [1, 2]})));

        assert_eq!(state.storage_get("count"), Some(serde_json::json!(3)));
        assert_eq!(
            state.storage_get("nested"),
            Some(serde_json::json!({"a": [1, 2]}))
        );
        assert_eq!(state.storage_get("missing"), None);

        // File is an indented JSON object.
        let raw =
            std::fs::read_to_string(state.extension.data_dir.join(STORAGE_FILE)).unwrap();
        assert!(raw.starts_with('{'));
        assert!(raw.contains('\n'));

        assert!(state.storage_remove("count"));
        assert_eq!(state.storage_get("count"), None);
    }

    #[test]
    fn credentials_roundtrip_across_reload() {
        let state = api_state();
        let stored = state.credentials_store("api_key", serde_json::json!("sekrit"));
        assert_eq!(stored["success"], serde_json::json!(true));

        assert_eq!(
            state.credentials_get("api_key").unwrap(),
            Some(serde_json::json!("sekrit"))
        );
        assert!(state.credentials_has("api_key"));
        assert!(!state.credentials_has("missing"));

        // Simulate a process restart: a fresh runtime over the same data dir
        // (salt persists on disk).
        let extension = Arc::clone(&state.extension);
        let runtime2 =
            ExtensionRuntime::new(extension, Arc::new(HostServices::new())).unwrap();
        assert_eq!(
            runtime2.state.credentials_get("api_key").unwrap(),
            Some(serde_json::json!("sekrit"))
        );
    }

    #[test]
    fn tampered_ciphertext_fails_loudly() {
        let state = api_state();
        state.credentials_store("k", serde_json::json!("v"));

        let path = state.extension.data_dir.join(CREDENTIALS_FILE);
        let mut data = std::fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0x01;
        std::fs::write(&path, &data).unwrap();

        let err = state.credentials_get("k").unwrap_err();
        assert!(matches!(err, Error::Crypto(_)));
        assert!(!state.credentials_has("k"));
    }

    #[test]
    fn nonces_are_unique_per_store() {
        let state = api_state();
        state.credentials_store("k", serde_json::json!("v1"));
        let first = std::fs::read(state.extension.data_dir.join(CREDENTIALS_FILE)).unwrap();
        state.credentials_store("k", serde_json::json!("v1"));
        let second = std::fs::read(state.extension.data_dir.join(CREDENTIALS_FILE)).unwrap();

        assert_ne!(
            &first[..NONCE_LEN],
            &second[..NONCE_LEN],
            "two seals must use distinct nonces"
        );
    }

    #[test]
    fn salt_is_32_bytes_and_stable() {
        let state = api_state();
        state.credentials_store("k", serde_json::json!("v"));

        let salt_path = state.extension.data_dir.join(SALT_FILE);
        let salt1 = std::fs::read(&salt_path).unwrap();
        assert_eq!(salt1.len(), SALT_LEN);

        state.credentials_store("k2", serde_json::json!("v2"));
        let salt2 = std::fs::read(&salt_path).unwrap();
        assert_eq!(salt1, salt2, "salt is created once and persisted");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt as _;
            let mode = std::fs::metadata(&salt_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn cross_extension_isolation() {
        // Two stores sealed for different ids must not open with each other's
        // derived key even when the salt bytes are copied over.
        let state_a = api_state();
        state_a.credentials_store("k", serde_json::json!("v"));

        let sealed = std::fs::read(state_a.extension.data_dir.join(CREDENTIALS_FILE)).unwrap();
        let salt = std::fs::read(state_a.extension.data_dir.join(SALT_FILE)).unwrap();

        let mut hasher = Sha256::new();
        hasher.update(b"another-extension");
        hasher.update(&salt);
        let wrong_key: [u8; 32] = hasher.finalize().into();

        assert!(decrypt_aes_gcm(&sealed, &wrong_key).is_err());
    }

    #[test]
    fn aes_gcm_helpers_roundtrip() {
        let key = [7_u8; 32];
        let sealed = encrypt_aes_gcm(b"hello world", &key).unwrap();
        assert_eq!(decrypt_aes_gcm(&sealed, &key).unwrap(), b"hello world");

        assert!(decrypt_aes_gcm(&sealed[..8], &key).is_err());
        let mut other_key = key;
        other_key[0] ^= 0xff;
        assert!(decrypt_aes_gcm(&sealed, &other_key).is_err());
    }
}
