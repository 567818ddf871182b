//! Extension manifest parsing and the permission model.
//!
//! A manifest is the declarative permission document accompanying an
//! extension: identity fields, a set of type tags describing what the
//! extension provides, and the capabilities it may use (network allow-list,
//! file access, storage). Manifests are immutable after load; every
//! capability gate consults them read-only.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Type tag for extensions that resolve track/album metadata.
pub const TYPE_METADATA_PROVIDER: &str = "metadata_provider";
/// Type tag for extensions that source audio downloads.
pub const TYPE_DOWNLOAD_PROVIDER: &str = "download_provider";

/// Capabilities an extension declares up front.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExtensionPermissions {
    /// Allowed hosts. Either literal hosts (`api.example.com`) or wildcard
    /// patterns with exactly one leading `*.` (`*.example.com`).
    pub network: Vec<String>,
    /// Whether the extension may touch the filesystem at all.
    pub file: bool,
    /// Whether the extension may use the plaintext storage API.
    pub storage: bool,
}

/// Parsed extension manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionManifest {
    pub name: String,
    #[serde(default, rename = "displayName")]
    pub display_name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub description: String,
    /// Type tags, e.g. `metadata_provider`, `download_provider`.
    #[serde(default, rename = "type")]
    pub types: Vec<String>,
    #[serde(default)]
    pub permissions: ExtensionPermissions,
}

impl ExtensionManifest {
    /// Parse and validate a manifest from raw JSON bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let manifest: Self = serde_json::from_slice(bytes)?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::validation("Extension manifest is missing 'name'"));
        }
        if self.types.is_empty() {
            return Err(Error::validation(
                "Extension manifest declares no 'type' tags",
            ));
        }
        Ok(())
    }

    /// Whether `host` is covered by the manifest's network allow-list.
    ///
    /// Matching is case-insensitive. A wildcard `*.suffix` matches `suffix`
    /// itself as well as any chain of subdomains below it.
    pub fn is_domain_allowed(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        for pattern in &self.permissions.network {
            let pattern = pattern.trim().to_ascii_lowercase();
            if let Some(suffix) = pattern.strip_prefix("*.") {
                if host == suffix || host.ends_with(&format!(".{suffix}")) {
                    return true;
                }
            } else if host == pattern {
                return true;
            }
        }
        false
    }

    /// Whether the manifest carries the given type tag.
    pub fn has_type(&self, tag: &str) -> bool {
        self.types.iter().any(|t| t == tag)
    }

    pub fn is_metadata_provider(&self) -> bool {
        self.has_type(TYPE_METADATA_PROVIDER)
    }

    pub fn is_download_provider(&self) -> bool {
        self.has_type(TYPE_DOWNLOAD_PROVIDER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_manifest() {
        let raw = br#"{
            "name": "test-provider",
            "displayName": "Test Provider",
            "version": "1.0.0",
            "author": "Test Author",
            "description": "A test extension",
            "type": ["metadata_provider"],
            "permissions": {
                "network": ["api.test.com"],
                "storage": true
            }
        }"#;

        let manifest = ExtensionManifest::parse(raw).unwrap();
        assert_eq!(manifest.name, "test-provider");
        assert_eq!(manifest.display_name, "Test Provider");
        assert_eq!(manifest.version, "1.0.0");
        assert_eq!(manifest.author, "Test Author");
        assert!(manifest.is_metadata_provider());
        assert!(!manifest.is_download_provider());
        assert!(manifest.permissions.storage);
        assert!(!manifest.permissions.file);
    }

    #[test]
    fn reject_missing_name() {
        let raw = br#"{
            "version": "1.0.0",
            "type": ["metadata_provider"]
        }"#;
        assert!(ExtensionManifest::parse(raw).is_err());
    }

    #[test]
    fn reject_missing_type() {
        let raw = br#"{
            "name": "test-provider",
            "version": "1.0.0"
        }"#;
        assert!(ExtensionManifest::parse(raw).is_err());
    }

    #[test]
    fn manifest_roundtrip() {
        let raw = br#"{
            "name": "rt",
            "displayName": "RT",
            "version": "2.1.0",
            "author": "a",
            "description": "d",
            "type": ["download_provider", "metadata_provider"],
            "permissions": { "network": ["*.cdn.example"], "file": true, "storage": true }
        }"#;
        let manifest = ExtensionManifest::parse(raw).unwrap();
        let encoded = serde_json::to_vec(&manifest).unwrap();
        let back = ExtensionManifest::parse(&encoded).unwrap();
        assert_eq!(back.name, manifest.name);
        assert_eq!(back.types, manifest.types);
        assert_eq!(back.permissions, manifest.permissions);
    }

    #[test]
    fn domain_allow_list() {
        let manifest = ExtensionManifest {
            name: "t".into(),
            display_name: String::new(),
            version: String::new(),
            author: String::new(),
            description: String::new(),
            types: vec![TYPE_METADATA_PROVIDER.into()],
            permissions: ExtensionPermissions {
                network: vec!["api.test.com".into(), "*.example.com".into()],
                file: false,
                storage: false,
            },
        };

        let cases = [
            ("api.test.com", true),
            ("API.TEST.COM", true),
            ("api.example.com", true),
            ("sub.example.com", true),
            ("a.b.example.com", true),
            // A wildcard covers the bare suffix too.
            ("example.com", true),
            ("notexample.com", false),
            ("notallowed.com", false),
            ("test.com", false),
        ];
        for (host, expected) in cases {
            assert_eq!(
                manifest.is_domain_allowed(host),
                expected,
                "is_domain_allowed({host})"
            );
        }
    }
}
