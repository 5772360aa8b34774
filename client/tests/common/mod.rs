#![allow(dead_code)]

pub mod test_relay;

pub use test_relay::{RelayBehavior, TestRelay};

use std::sync::Arc;

use anyhow::{Result, anyhow};
use client::clock::SystemClock;
use client::storage::{MemoryStorage, PlayerSettings, SETTINGS_KEY, Storage};
use client::{ClientConfig, GameServer, RetryPolicy};
use ::common::{PlayerId, Variant};
use tokio::time::{Duration, Instant, sleep};

/// Macro to wrap test functions with a timeout to prevent hanging tests
#[macro_export]
macro_rules! timeout_test {
    ($duration:expr, $body:expr) => {
        tokio::time::timeout($duration, $body)
            .await
            .map_err(|_| anyhow::anyhow!("Test timed out after {:?}", $duration))?
    };
}

/// Short timeouts and budgets so failure paths finish quickly
pub fn test_config(relay_url: &str) -> ClientConfig {
    let mut config = ClientConfig::default().with_relay_url(relay_url);
    config.handshake_timeout = Duration::from_millis(500);
    config.connect_timeout = Duration::from_secs(3);
    config.request_timeout = Duration::from_millis(500);
    config.short_retry = RetryPolicy::new(Duration::from_millis(20), 5);
    config.long_retry = RetryPolicy::new(Duration::from_millis(20), 20);
    config.local_input_debounce = Duration::ZERO;
    config.snapshot_debounce = Duration::from_millis(20);
    config
}

pub fn store_settings(storage: &MemoryStorage, settings: &PlayerSettings) -> Result<()> {
    storage.store(SETTINGS_KEY, &serde_json::to_string(settings)?)
}

pub fn settings_named(name: &str, variant: Variant) -> PlayerSettings {
    PlayerSettings {
        name: name.to_string(),
        variant,
        ..PlayerSettings::default()
    }
}

pub fn start_client(config: ClientConfig, storage: &MemoryStorage) -> GameServer {
    GameServer::start(config, Arc::new(storage.clone()), Arc::new(SystemClock))
}

/// Client with its own fresh storage and the given settings
pub fn start_player(relay: &TestRelay, settings: &PlayerSettings) -> Result<GameServer> {
    let storage = MemoryStorage::new();
    store_settings(&storage, settings)?;
    Ok(start_client(test_config(&relay.url), &storage))
}

/// Polls `condition` until it holds or `wait` runs out
pub async fn eventually(wait: Duration, mut condition: impl FnMut() -> bool) -> Result<()> {
    let deadline = Instant::now() + wait;
    while !condition() {
        if Instant::now() >= deadline {
            return Err(anyhow!("Condition not met within {:?}", wait));
        }
        sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

/// Two identified clients paired through `game:start` from the first one
pub async fn paired_players(
    relay: &TestRelay,
    first: &PlayerSettings,
    second: &PlayerSettings,
) -> Result<(GameServer, GameServer)> {
    let alice = start_player(relay, first)?;
    let bob = start_player(relay, second)?;
    alice.connect().await?;
    let bob_id: PlayerId = bob.connect().await?.id;

    alice.start_game(&bob_id).await?;
    eventually(Duration::from_secs(2), || {
        alice.opponent().is_some() && bob.opponent().is_some()
    })
    .await?;
    Ok((alice, bob))
}
