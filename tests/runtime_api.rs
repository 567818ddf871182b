//! The host API surface as an extension sees it: utilities, matching,
//! storage, credentials, and the browser polyfills, all driven through real
//! scripts.

mod common;

use common::host;
use serde_json::json;

#[test]
fn utils_digests_and_base64() {
    let host = host(&[], false, false);

    assert_eq!(
        host.runtime.eval(r#"utils.base64Encode("hello")"#).unwrap(),
        json!("aGVsbG8=")
    );
    assert_eq!(
        host.runtime.eval(r#"utils.base64Decode("aGVsbG8=")"#).unwrap(),
        json!("hello")
    );
    assert_eq!(
        host.runtime.eval(r#"utils.md5("hello")"#).unwrap(),
        json!("5d41402abc4b2a76b9719d911017c592")
    );
    assert_eq!(
        host.runtime.eval(r#"utils.sha1("hello")"#).unwrap(),
        json!("aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d")
    );
    assert_eq!(
        host.runtime.eval(r#"utils.sha256("hello")"#).unwrap(),
        json!("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824")
    );
}

#[test]
fn utils_json_helpers() {
    let host = host(&[], false, false);

    assert_eq!(
        host.runtime
            .eval(r#"utils.parseJSON('{"a": [1, 2]}').a[1]"#)
            .unwrap(),
        json!(2)
    );
    assert_eq!(
        host.runtime.eval(r#"utils.parseJSON("not json")"#).unwrap(),
        json!(null)
    );

    let text = host
        .runtime
        .eval(r#"utils.stringifyJSON({name: "test", value: 123})"#)
        .unwrap();
    let round: serde_json::Value = serde_json::from_str(text.as_str().unwrap()).unwrap();
    assert_eq!(round, json!({"name": "test", "value": 123}));
}

#[test]
fn matching_through_the_vm() {
    let host = host(&[], false, false);

    let score = host
        .runtime
        .eval(r#"matching.compareStrings("Hello", "hello")"#)
        .unwrap();
    assert_eq!(score.as_f64(), Some(1.0));
    assert_eq!(
        host.runtime
            .eval(r#"matching.normalizeString("Song (Remastered) feat. X")"#)
            .unwrap(),
        json!("song")
    );
    assert_eq!(
        host.runtime
            .eval("matching.compareDuration(180000, 182000)")
            .unwrap(),
        json!(true)
    );
    assert_eq!(
        host.runtime
            .eval("matching.compareDuration(180000, 190000)")
            .unwrap(),
        json!(false)
    );
    assert_eq!(
        host.runtime
            .eval("matching.compareDuration(180000, 190000, 15000)")
            .unwrap(),
        json!(true)
    );
}

#[test]
fn storage_roundtrip_via_scripts() {
    let host = host(&[], false, true);

    assert_eq!(
        host.runtime
            .eval(r#"storage.set("cfg", {retries: 3, tags: ["a", "b"]})"#)
            .unwrap(),
        json!(true)
    );
    assert_eq!(
        host.runtime.eval(r#"storage.get("cfg").retries"#).unwrap(),
        json!(3)
    );
    assert_eq!(
        host.runtime
            .eval(r#"storage.get("missing", "fallback")"#)
            .unwrap(),
        json!("fallback")
    );
    assert_eq!(
        host.runtime.eval(r#"storage.remove("cfg")"#).unwrap(),
        json!(true)
    );
    assert_eq!(
        host.runtime.eval(r#"storage.get("cfg")"#).unwrap(),
        json!(null)
    );

    // The backing file lives in the extension's data dir.
    assert!(host.data_dir.join("storage.json").exists());
}

#[test]
fn credentials_roundtrip_via_scripts() {
    let host = host(&[], false, true);

    assert_eq!(
        host.runtime
            .eval(r#"credentials.store("token", "s3cret").success"#)
            .unwrap(),
        json!(true)
    );
    assert_eq!(
        host.runtime.eval(r#"credentials.get("token")"#).unwrap(),
        json!("s3cret")
    );
    assert_eq!(
        host.runtime.eval(r#"credentials.has("token")"#).unwrap(),
        json!(true)
    );
    assert_eq!(
        host.runtime.eval(r#"credentials.remove("token")"#).unwrap(),
        json!(true)
    );
    assert_eq!(
        host.runtime.eval(r#"credentials.has("token")"#).unwrap(),
        json!(false)
    );

    // Ciphertext and salt are on disk; plaintext is not.
    let sealed = std::fs::read(host.data_dir.join(".credentials.enc")).unwrap();
    assert!(!sealed.windows(6).any(|w| w == b"s3cret"));
    assert_eq!(std::fs::read(host.data_dir.join(".cred_salt")).unwrap().len(), 32);
}

#[test]
fn text_codec_polyfills() {
    let host = host(&[], false, false);

    assert_eq!(
        host.runtime
            .eval("new TextEncoder().encode('hi')")
            .unwrap(),
        json!([104, 105])
    );
    assert_eq!(
        host.runtime
            .eval("new TextDecoder().decode([104, 105])")
            .unwrap(),
        json!("hi")
    );
    assert_eq!(
        host.runtime
            .eval("new TextDecoder().decode(new TextEncoder().encode('héllo ✓'))")
            .unwrap(),
        json!("héllo ✓")
    );
    assert_eq!(
        host.runtime.eval("new TextEncoder().encoding").unwrap(),
        json!("utf-8")
    );
}

#[test]
fn atob_btoa_polyfills() {
    let host = host(&[], false, false);

    assert_eq!(host.runtime.eval(r#"btoa("hello")"#).unwrap(), json!("aGVsbG8="));
    assert_eq!(host.runtime.eval(r#"atob("aGVsbG8=")"#).unwrap(), json!("hello"));
    // URL-safe fallback on standard-decode failure.
    assert_eq!(host.runtime.eval(r#"atob("aGk_aGk=")"#).unwrap(), json!("hi?hi"));
    assert_eq!(host.runtime.eval(r#"atob("%%%")"#).unwrap(), json!(""));
}

#[test]
fn url_polyfill() {
    let host = host(&[], false, false);

    let checks = [
        (
            "new URL('https://example.com:8443/a/b?x=1#f').hostname",
            json!("example.com"),
        ),
        (
            "new URL('https://example.com:8443/a/b?x=1#f').port",
            json!("8443"),
        ),
        (
            "new URL('https://example.com:8443/a/b?x=1#f').pathname",
            json!("/a/b"),
        ),
        (
            "new URL('https://example.com:8443/a/b?x=1#f').search",
            json!("?x=1"),
        ),
        (
            "new URL('https://example.com:8443/a/b?x=1#f').hash",
            json!("#f"),
        ),
        (
            "new URL('https://example.com/a?x=1&x=2').searchParams.getAll('x')",
            json!(["1", "2"]),
        ),
        (
            "new URL('https://example.com/a?x=1').searchParams.get('x')",
            json!("1"),
        ),
        (
            "new URL('/rel?q=2', 'https://example.com/base').href",
            json!("https://example.com/rel?q=2"),
        ),
        (
            "new URL('https://u:p@example.com/').username",
            json!("u"),
        ),
    ];
    for (script, expected) in checks {
        assert_eq!(host.runtime.eval(script).unwrap(), expected, "{script}");
    }
}

#[test]
fn url_search_params_polyfill() {
    let host = host(&[], false, false);

    assert_eq!(
        host.runtime
            .eval("var p = new URLSearchParams('b=2&a=1'); p.append('a', '3'); p.getAll('a')")
            .unwrap(),
        json!(["1", "3"])
    );
    assert_eq!(
        host.runtime
            .eval("var q = new URLSearchParams({x: 1, y: 'z'}); q.get('x')")
            .unwrap(),
        json!("1")
    );
    assert_eq!(
        host.runtime
            .eval("var r = new URLSearchParams('a=1&b=2'); r.set('a', '9'); r.delete('b'); r.toString()")
            .unwrap(),
        json!("a=9")
    );
    assert_eq!(
        host.runtime
            .eval("new URLSearchParams('k=v').has('k')")
            .unwrap(),
        json!(true)
    );
}
