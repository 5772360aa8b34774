mod common;

use std::sync::Arc;

use anyhow::Result;
use chrono::{TimeDelta, Utc};
use client::snapshot_store::SnapshotStore;
use client::storage::{MemoryStorage, PlayerSettings, SNAPSHOT_KEY};
use ::common::{
    ClientMessage, EntryOrigin, GameHistory, Opponent, PlayerId, ScoreEntry, ScoreKind, Snapshot,
};
use tokio::time::{Duration, sleep};

use crate::common::{TestRelay, start_client, store_settings, test_config};

fn snapshot_aged(age: TimeDelta) -> Snapshot {
    let at = Utc::now() - age;
    let history = GameHistory::from(vec![
        ScoreEntry::new(100, ScoreKind::Point, EntryOrigin::Local, at),
        ScoreEntry::new(40, ScoreKind::Point, EntryOrigin::Local, at),
    ]);
    Snapshot {
        history,
        opponent: Some(Opponent::new(PlayerId::from("7777"), "Bob")),
        last_event_at: at,
    }
}

fn seeded_storage(snapshot: &Snapshot) -> Result<MemoryStorage> {
    let storage = MemoryStorage::new();
    store_settings(
        &storage,
        &PlayerSettings {
            player_id: Some(PlayerId::from("4321")),
            name: "Alice".to_string(),
            ..PlayerSettings::default()
        },
    )?;
    SnapshotStore::new(Arc::new(storage.clone()), Snapshot::ttl()).save_now(snapshot)?;
    Ok(storage)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fresh_snapshot_is_restored_and_announced() -> Result<()> {
    timeout_test!(Duration::from_secs(10), async {
        let _ = tracing_subscriber::fmt::try_init();

        let relay = TestRelay::start().await?;
        relay.register_known("4321");
        let storage = seeded_storage(&snapshot_aged(TimeDelta::minutes(1)))?;
        let server = start_client(test_config(&relay.url), &storage);

        // Restored before any network activity
        assert_eq!(server.total(), 140);
        assert_eq!(server.last_three(), vec![100, 40]);
        assert_eq!(
            server.opponent().map(|opponent| opponent.id),
            Some(PlayerId::from("7777"))
        );

        let announced = relay
            .wait_for(Duration::from_secs(2), |message| {
                matches!(message, ClientMessage::StateUpdate { .. })
            })
            .await?;
        match announced {
            ClientMessage::StateUpdate {
                player_id,
                name,
                history,
                total,
                opponent_id,
                ..
            } => {
                assert_eq!(player_id.as_str(), "4321");
                assert_eq!(name, "Alice");
                assert_eq!(history.len(), 2);
                assert_eq!(total, 140);
                assert_eq!(opponent_id, Some(PlayerId::from("7777")));
            }
            other => panic!("unexpected message {:?}", other),
        }

        // The handshake comes first, the restored state right after it
        let kinds: Vec<&str> = relay.received().iter().map(ClientMessage::kind).collect();
        assert_eq!(kinds[..2], ["player:reconnect", "player:state_update"]);

        // Restoring does not echo scores to the opponent
        assert_eq!(relay.count("game:score_update"), 0);

        relay.shutdown().await?;
        Ok(())
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stale_snapshot_is_discarded() -> Result<()> {
    timeout_test!(Duration::from_secs(10), async {
        let _ = tracing_subscriber::fmt::try_init();

        let relay = TestRelay::start().await?;
        relay.register_known("4321");
        let storage = seeded_storage(&snapshot_aged(TimeDelta::minutes(11)))?;
        let server = start_client(test_config(&relay.url), &storage);

        assert_eq!(server.total(), 0);
        assert!(server.opponent().is_none());
        assert!(!storage.contains(SNAPSHOT_KEY));

        server.connect().await?;
        sleep(Duration::from_millis(100)).await;
        assert_eq!(relay.count("player:state_update"), 0);

        relay.shutdown().await?;
        Ok(())
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_scores_survive_restart() -> Result<()> {
    timeout_test!(Duration::from_secs(10), async {
        let _ = tracing_subscriber::fmt::try_init();

        let relay = TestRelay::start().await?;
        let storage = MemoryStorage::new();
        let server = start_client(test_config(&relay.url), &storage);
        server.add_points(100)?;
        server.add_points(250)?;
        server.flush_snapshot().await;
        assert!(storage.contains(SNAPSHOT_KEY));
        drop(server);

        let server = start_client(test_config(&relay.url), &storage);
        assert_eq!(server.total(), 350);

        // A reset clears the stored hand
        server.reset(true, || true);
        server.flush_snapshot().await;
        assert!(!storage.contains(SNAPSHOT_KEY));
        drop(server);

        let server = start_client(test_config(&relay.url), &storage);
        assert_eq!(server.total(), 0);

        relay.shutdown().await?;
        Ok(())
    })
}
