//! End-to-end scenarios against the public cache interface.
//!
//! Every test owns its own database under a temporary directory and its own
//! cache instance; nothing is shared between tests.

use async_trait::async_trait;
use selector_cache::{
    CacheConfig, CacheError, DomElement, DomSnapshot, HitSource, OperationError,
    SnapshotProvider, TestStep, TieredSelectorCache,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

async fn open_cache() -> (TempDir, TieredSelectorCache) {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new().expect("tempdir");
    let mut config = CacheConfig::new().with_cache_dir(dir.path());
    config.preload_common_selectors = false;
    let cache = TieredSelectorCache::open(config).await.expect("open cache");
    (dir, cache)
}

struct LoginPage;

#[async_trait]
impl SnapshotProvider for LoginPage {
    async fn dom_snapshot(&self) -> Option<DomSnapshot> {
        Some(DomSnapshot {
            url: String::new(),
            elements: vec![
                DomElement::new("form").with_id("login-form"),
                DomElement::new("nav"),
                DomElement::new("input").with_name("username"),
                DomElement::new("input").with_name("password"),
                DomElement::new("button")
                    .with_role("button")
                    .with_id("login")
                    .with_text("Log in"),
                DomElement::new("h1").with_text("Welcome back"),
            ],
        })
    }
}

#[tokio::test]
async fn scenario_exact_hit() {
    let (_dir, cache) = open_cache().await;

    cache
        .set("click login", "https://a/", "button#login")
        .await
        .expect("set");

    let hit = cache
        .get("click login", "https://a/")
        .await
        .expect("get")
        .expect("hit");
    assert_eq!(hit.selector, "button#login");
    assert_eq!(hit.source, HitSource::Exact);
    assert!(hit.confidence >= 0.5);
    assert!(hit.cached);

    cache.close().await.expect("close");
}

#[tokio::test]
async fn scenario_normalized_hit_with_synonym() {
    let (_dir, cache) = open_cache().await;

    cache
        .set("click login button", "https://a/", "#login")
        .await
        .expect("set");

    let hit = cache
        .get("press login button", "https://a/")
        .await
        .expect("get")
        .expect("hit");
    assert_eq!(hit.selector, "#login");
    assert!(
        matches!(hit.source, HitSource::Normalized | HitSource::Reverse),
        "got {:?}",
        hit.source
    );

    cache.close().await.expect("close");
}

#[tokio::test]
async fn scenario_action_conflict_rejection() {
    let (_dir, cache) = open_cache().await;

    cache
        .set("click login button", "https://a/", "#login")
        .await
        .expect("set");

    // token overlap notwithstanding, logout must never resolve to #login
    let miss = cache.get("logout user", "https://a/").await.expect("get");
    assert!(miss.is_none());

    cache.close().await.expect("close");
}

#[tokio::test]
async fn scenario_fuzzy_tolerance() {
    let (_dir, cache) = open_cache().await;

    cache
        .set("submit form", "https://a/", ".submit")
        .await
        .expect("set");

    let stored = cache
        .get("submit form", "https://a/")
        .await
        .expect("get")
        .expect("stored hit");

    let hit = cache
        .get("submiit form", "https://a/")
        .await
        .expect("get")
        .expect("fuzzy hit");
    assert_eq!(hit.selector, ".submit");
    assert_eq!(hit.source, HitSource::Fuzzy);
    assert!(hit.confidence < stored.confidence);

    cache.close().await.expect("close");
}

#[tokio::test]
async fn scenario_self_healing_on_failure() {
    let (_dir, cache) = open_cache().await;
    let url = "https://a/";

    cache.set("save", url, "btn.old").await.expect("set");

    let calls = AtomicUsize::new(0);
    let outcome = cache
        .wrap_selector_operation(
            "save",
            url,
            |selector| {
                calls.fetch_add(1, Ordering::Relaxed);
                async move {
                    if selector == "btn.old" {
                        Err(OperationError::from("detached from DOM"))
                    } else if selector == "text=\"save\"" {
                        Ok("saved")
                    } else {
                        Err("no such element".into())
                    }
                }
            },
            None,
            Duration::from_secs(1),
        )
        .await
        .expect("self-healed operation");

    assert!(!outcome.cached, "the healed selector was freshly discovered");
    assert_eq!(outcome.selector, "text=\"save\"");
    assert_eq!(outcome.result, "saved");
    assert!(calls.load(Ordering::Relaxed) >= 2);

    // the replacement is cached, the stale selector never comes back
    let hit = cache.get("save", url).await.expect("get").expect("hit");
    assert_eq!(hit.selector, "text=\"save\"");
    assert_ne!(hit.selector, "btn.old");

    cache.close().await.expect("close");
}

#[tokio::test]
async fn scenario_cross_environment_reuse() {
    let (_dir, cache) = open_cache().await;
    let steps = vec![
        TestStep::new("goto"),
        TestStep::new("fill")
            .with_selector("#username")
            .with_value("alice"),
        TestStep::new("click").with_selector("button#login"),
    ];
    let staging_page = LoginPage;
    let prod_page = LoginPage;

    cache
        .set_enhanced(
            "login flow",
            "https://staging.x/path/42",
            &steps,
            "default",
            "#login",
            Some(&staging_page),
        )
        .await
        .expect("set_enhanced");

    let hit = cache
        .get_enhanced(
            "login flow",
            "https://prod.x/path/99",
            &steps,
            "default",
            Some(&prod_page),
        )
        .await
        .expect("get_enhanced")
        .expect("cross-environment hit");
    assert_eq!(hit.selector, "#login");
    assert_eq!(hit.source, HitSource::Exact);
    assert!(hit.confidence > 0.0 && hit.confidence <= 1.0);

    cache.close().await.expect("close");
}

#[tokio::test]
async fn scenario_invalidation_is_immediate() {
    let (_dir, cache) = open_cache().await;
    let url = "https://a/";

    cache.set("click login", url, "#login").await.expect("set");
    cache
        .invalidate_selector("#login", url)
        .await
        .expect("invalidate");

    assert!(cache.get("click login", url).await.expect("get").is_none());

    cache.close().await.expect("close");
}

#[tokio::test]
async fn scenario_stats_track_activity() {
    let (_dir, cache) = open_cache().await;

    cache.set("click login", "https://a/", "#login").await.expect("set");
    let _ = cache.get("click login", "https://a/").await.expect("get");
    let _ = cache.get("never stored", "https://a/").await.expect("get");

    let stats = cache.stats().await;
    assert_eq!(stats.sets, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.storage.total_mappings, 1);
    assert!(stats.hit_rate > 0.0 && stats.hit_rate < 1.0);

    cache.clear().await.expect("clear");
    let stats = cache.stats().await;
    assert_eq!(stats.storage.total_mappings, 0);

    cache.close().await.expect("close");
}

#[tokio::test]
async fn scenario_variation_cap_enforced_by_sweep() {
    let (_dir, cache) = open_cache().await;
    let url = "https://a/";

    // K = 20 by default; write K + 5 distinct phrasings for one selector
    for i in 0..25 {
        cache
            .set(&format!("click login variant {}", i), url, "#login")
            .await
            .expect("set");
    }

    let outcome = cache.sweep_now().await.expect("sweep");
    assert_eq!(outcome.pruned_variations, 5);

    let stats = cache.stats().await;
    assert_eq!(stats.storage.total_mappings, 20);

    cache.close().await.expect("close");
}

#[tokio::test]
async fn scenario_closed_cache_rejects_use() {
    let (_dir, cache) = open_cache().await;
    cache.close().await.expect("close");
    cache.close().await.expect("close twice");

    assert!(matches!(
        cache.get("x", "https://a/").await,
        Err(CacheError::Closed)
    ));
}

#[tokio::test]
async fn scenario_configuration_rejected_up_front() {
    let dir = TempDir::new().expect("tempdir");
    let mut config = CacheConfig::new().with_cache_dir(dir.path());
    config.memory_size = 0;

    match TieredSelectorCache::open(config).await {
        Err(CacheError::Config(message)) => assert!(message.contains("memory_size")),
        other => panic!("expected a configuration error, got {:?}", other.map(|_| ())),
    }
}
