//! End-to-end tests: ModuleCache with the HTTP fetcher against wiremock, and
//! the extension config converter on top of it.

use std::sync::Arc;
use std::time::Duration;

use meshmod_wasm::convert::resource::{
    Any, AsyncDataSource, HttpUri, PluginConfig, RemoteDataSource, TypedExtensionConfig, VmConfig,
    Wasm, TYPED_EXTENSION_CONFIG_TYPE, WASM_HTTP_FILTER_TYPE,
};
use meshmod_wasm::digest::sha256_hex;
use meshmod_wasm::{
    ExtensionConfigConverter, FetchOptions, ModuleCache, ModuleCacheConfig, PullPolicy, WasmError,
};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const MODULE: &[u8] = b"\0asm\x01\x00\x00\x00";

fn module_with_tag(tag: u8) -> Vec<u8> {
    // Custom section "t" carrying one byte.
    let mut bytes = MODULE.to_vec();
    bytes.extend_from_slice(&[0, 3, 1, b't', tag]);
    bytes
}

async fn create_test_cache() -> (ModuleCache, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let config = ModuleCacheConfig::default()
        .with_dir(temp_dir.path().join("wasm"))
        .with_max_retries(0);
    let cache = ModuleCache::from_config(config)
        .await
        .expect("failed to create cache");
    (cache, temp_dir)
}

async fn mount_module(mock_server: &MockServer, route: &str, body: &[u8], expected_calls: u64) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .expect(expected_calls)
        .mount(mock_server)
        .await;
}

#[tokio::test]
async fn test_nil_checksum_then_cached_then_always() {
    let mock_server = MockServer::start().await;
    mount_module(&mock_server, "/module.wasm", MODULE, 2).await;
    let (cache, _temp_dir) = create_test_cache().await;
    let uri = format!("{}/module.wasm", mock_server.uri());

    let first = cache
        .get(&uri, "nil", &FetchOptions::new().with_policy(PullPolicy::IfNotPresent))
        .await
        .expect("first resolve");
    assert_eq!(first.checksum, sha256_hex(MODULE));
    assert_eq!(std::fs::read(&first.path).unwrap(), MODULE);

    let second = cache
        .get(&uri, "", &FetchOptions::new().with_policy(PullPolicy::IfNotPresent))
        .await
        .expect("second resolve");
    assert_eq!(second.path, first.path);

    let third = cache
        .get(&uri, "", &FetchOptions::new().with_policy(PullPolicy::Always))
        .await
        .expect("third resolve");
    assert_eq!(third.checksum, first.checksum);
}

#[tokio::test]
async fn test_concurrent_resolves_download_once() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow.wasm"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(MODULE)
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&mock_server)
        .await;
    let (cache, _temp_dir) = create_test_cache().await;
    let uri = format!("{}/slow.wasm", mock_server.uri());

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..10 {
        let cache = cache.clone();
        let uri = uri.clone();
        tasks.spawn(async move { cache.get(&uri, "", &FetchOptions::new()).await });
    }

    let mut paths = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        paths.push(joined.unwrap().expect("resolve failed").path);
    }
    assert_eq!(paths.len(), 10);
    assert!(paths.iter().all(|p| *p == paths[0]));
}

#[tokio::test]
async fn test_same_uri_different_checksums_are_distinct_files() {
    let mock_server = MockServer::start().await;
    let (a, b) = (module_with_tag(1), module_with_tag(2));
    Mock::given(method("GET"))
        .and(path("/module.wasm"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(a.clone()))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/module.wasm"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b.clone()))
        .mount(&mock_server)
        .await;
    let (cache, _temp_dir) = create_test_cache().await;
    let uri = format!("{}/module.wasm", mock_server.uri());

    let first = cache
        .get(&uri, &sha256_hex(&a), &FetchOptions::new())
        .await
        .expect("first checksum");
    let second = cache
        .get(&uri, &sha256_hex(&b), &FetchOptions::new())
        .await
        .expect("second checksum");

    assert_ne!(first.path, second.path);
    assert_eq!(std::fs::read(&first.path).unwrap(), a);
    assert_eq!(std::fs::read(&second.path).unwrap(), b);
    assert_eq!(cache.len().await, 2);
}

#[tokio::test]
async fn test_checksum_mismatch_is_never_visible() {
    let mock_server = MockServer::start().await;
    mount_module(&mock_server, "/module.wasm", MODULE, 2).await;
    let (cache, _temp_dir) = create_test_cache().await;
    let uri = format!("{}/module.wasm", mock_server.uri());
    let wrong = "ab".repeat(32);

    for _ in 0..2 {
        let err = cache
            .get(&uri, &wrong, &FetchOptions::new().with_policy(PullPolicy::IfNotPresent))
            .await
            .unwrap_err();
        assert!(matches!(err, WasmError::ChecksumMismatch { .. }));
    }
    assert!(cache.is_empty().await);
}

#[tokio::test]
async fn test_never_policy_performs_no_network_io() {
    let mock_server = MockServer::start().await;
    mount_module(&mock_server, "/module.wasm", MODULE, 0).await;
    let (cache, _temp_dir) = create_test_cache().await;

    let err = cache
        .get(
            &format!("{}/module.wasm", mock_server.uri()),
            "",
            &FetchOptions::new().with_policy(PullPolicy::Never),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, WasmError::NotCached { .. }));
}

#[tokio::test]
async fn test_timeout_then_retry_with_longer_timeout() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/module.wasm"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(MODULE)
                .set_delay(Duration::from_millis(300)),
        )
        .expect(2)
        .mount(&mock_server)
        .await;
    let (cache, _temp_dir) = create_test_cache().await;
    let uri = format!("{}/module.wasm", mock_server.uri());

    let err = cache
        .get(
            &uri,
            "",
            &FetchOptions::new().with_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, WasmError::Timeout { .. }));
    assert!(err.is_fetch_failure());

    cache
        .get(&uri, "", &FetchOptions::new().with_timeout(Duration::from_secs(5)))
        .await
        .expect("second attempt");
}

fn remote_extension(name: &str, uri: &str) -> Any {
    let wasm = Wasm {
        config: Some(PluginConfig {
            name: name.to_string(),
            vm_config: Some(VmConfig {
                code: Some(AsyncDataSource {
                    remote: Some(RemoteDataSource {
                        http_uri: Some(HttpUri {
                            uri: uri.to_string(),
                            cluster: String::new(),
                            timeout: Some(Duration::from_secs(5)),
                        }),
                        sha256: "nil".to_string(),
                        ..Default::default()
                    }),
                    local: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };
    Any::pack(
        TYPED_EXTENSION_CONFIG_TYPE,
        &TypedExtensionConfig {
            name: name.to_string(),
            typed_config: Some(Any::pack(WASM_HTTP_FILTER_TYPE, &wasm).unwrap()),
            ..Default::default()
        },
    )
    .unwrap()
}

#[tokio::test]
async fn test_converter_batch_shares_downloads_and_reports_failures() {
    let mock_server = MockServer::start().await;
    mount_module(&mock_server, "/shared.wasm", MODULE, 1).await;
    Mock::given(method("GET"))
        .and(path("/broken.wasm"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&mock_server)
        .await;
    let (cache, _temp_dir) = create_test_cache().await;

    let shared = format!("{}/shared.wasm", mock_server.uri());
    let broken = format!("{}/broken.wasm", mock_server.uri());
    let mut resources = vec![
        remote_extension("ns.a", &shared),
        remote_extension("ns.b", &shared),
        remote_extension("ns.c", &broken),
    ];

    let converter = ExtensionConfigConverter::new(Arc::new(cache.clone()));
    let errors = converter.convert(&mut resources).await.unwrap_err();

    assert_eq!(errors.len(), 1);
    assert_eq!(errors.failures()[0].index, 2);
    assert_eq!(errors.failures()[0].resource.as_deref(), Some("ns.c"));

    for resource in &resources[..2] {
        let extension: TypedExtensionConfig = resource.unpack().unwrap();
        let wasm: Wasm = extension.typed_config.unwrap().unpack().unwrap();
        let filename = wasm
            .vm_config()
            .and_then(|vm| vm.code.as_ref())
            .and_then(|code| code.local.as_ref())
            .and_then(|local| local.filename.clone())
            .expect("rewritten to local file");
        assert_eq!(std::fs::read(filename).unwrap(), MODULE);
    }

    let artifact = cache.artifact(&shared, "").await.unwrap().unwrap();
    assert_eq!(artifact.reference_count(), 2);
    assert_eq!(converter.metrics().snapshot().success, 2);
}
