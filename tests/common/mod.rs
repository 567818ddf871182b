//! Shared harness for integration tests: a runtime bound to a throwaway
//! extension with configurable permissions.

use std::path::PathBuf;
use std::sync::Arc;
use tunevault::{
    ExtensionManifest, ExtensionPermissions, ExtensionRuntime, HostServices, LoadedExtension,
};

pub struct TestHost {
    pub runtime: ExtensionRuntime,
    pub services: Arc<HostServices>,
    pub data_dir: PathBuf,
    _tmp: tempfile::TempDir,
}

pub fn host(network: &[&str], file: bool, storage: bool) -> TestHost {
    let tmp = tempfile::tempdir().unwrap();
    let manifest = ExtensionManifest {
        name: "it-ext".into(),
        display_name: "Integration Extension".into(),
        version: "0.1.0".into(),
        author: String::new(),
        description: String::new(),
        types: vec!["download_provider".into()],
        permissions: ExtensionPermissions {
            network: network.iter().map(|s| (*s).to_string()).collect(),
            file,
            storage,
        },
    };

    let extension =
        LoadedExtension::new("it-ext", manifest, tmp.path().join("data"), "").unwrap();
    let data_dir = extension.data_dir.clone();

    let services = Arc::new(HostServices::new());
    let runtime = ExtensionRuntime::new(Arc::new(extension), Arc::clone(&services)).unwrap();

    TestHost {
        runtime,
        services,
        data_dir,
        _tmp: tmp,
    }
}
