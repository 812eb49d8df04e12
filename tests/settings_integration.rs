//! Settings changes reach the provider registry through the watcher.

mod common;

use std::time::Duration;

use aule::events::LifecycleEvent;
use aule::llm::ProviderBackend;
use aule::settings::{ProviderSettings, SettingsStore};

use common::{Behavior, Harness, TEST_TIMEOUT, eventually};

#[tokio::test]
async fn settings_update_swaps_providers() {
    let h = Harness::new(1, Behavior::default()).await;
    let store = SettingsStore::load(h.db.clone(), ProviderSettings::from_config(&h.config))
        .await
        .unwrap();
    let _watcher = h.lifecycle.watch_settings(store.subscribe());
    let mut events = h.events.subscribe();

    assert_eq!(h.lifecycle.providers().llm.name(), "v1-llm");

    store.update(store.current()).await.unwrap();

    let lifecycle = h.lifecycle.clone();
    eventually(|| lifecycle.providers().llm.name() == "ollama").await;
    let pair = h.lifecycle.providers();
    assert_eq!(pair.image.name(), "local-image");

    let event = tokio::time::timeout(TEST_TIMEOUT, events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        event,
        LifecycleEvent::ProvidersUpdated {
            llm: "ollama".to_string(),
            image: "local-image".to_string(),
        }
    );
}

#[tokio::test]
async fn rejected_settings_keep_current_providers() {
    let h = Harness::new(1, Behavior::default()).await;
    let store = SettingsStore::load(h.db.clone(), ProviderSettings::from_config(&h.config))
        .await
        .unwrap();
    let _watcher = h.lifecycle.watch_settings(store.subscribe());

    // Remote without an API key cannot be built.
    let mut broken = store.current();
    broken.llm.backend = ProviderBackend::Remote;
    store.update(broken).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let pair = h.lifecycle.providers();
    assert_eq!(pair.llm.name(), "v1-llm");
    assert_eq!(pair.image.name(), "v1-image");

    // A later good update still applies.
    let mut fixed = store.current();
    fixed.llm.backend = ProviderBackend::Local;
    store.update(fixed).await.unwrap();
    let lifecycle = h.lifecycle.clone();
    eventually(|| lifecycle.providers().llm.name() == "ollama").await;
}
