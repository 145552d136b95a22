use peerwatch_channels::{LivenessChannel, SimulatedChannel};
use peerwatch_core::{AccountId, Config, PeerId};
use peerwatch_presence::{PresenceEngine, PresenceStatus};
use std::sync::Arc;

#[tokio::test(start_paused = true)]
async fn sample_config_drives_engine() {
    let config = Config::sample();
    let channel = SimulatedChannel::new(config.simulator.probe_delay());
    for contact in &config.account.contacts {
        channel.add_peer(contact.clone(), true).await;
    }
    let channel: Arc<dyn LivenessChannel> = Arc::new(channel);

    let engine = PresenceEngine::start(config.presence.clone(), channel).unwrap();
    engine.set_account(config.account.id.clone()).await.unwrap();
    engine
        .track_all(config.account.contacts.clone())
        .await
        .unwrap();

    tokio::time::sleep(config.simulator.probe_delay() * 2).await;
    let all = engine.snapshot_all();
    assert_eq!(all.len(), config.account.contacts.len());
    assert!(all.iter().all(|p| p.status == PresenceStatus::Online));

    tokio_test::assert_ok!(engine.shutdown().await);
}

#[tokio::test]
async fn unknown_peer_reads_as_unknown() {
    let channel = Arc::new(SimulatedChannel::new(std::time::Duration::from_secs(1)));
    let engine = PresenceEngine::start(Default::default(), channel).unwrap();
    engine
        .set_account(Some(AccountId::from("acc")))
        .await
        .unwrap();

    let presence = engine.snapshot(&PeerId::from("nobody"));
    assert_eq!(presence.status, PresenceStatus::Unknown);
    assert!(presence.last_confirmed_at.is_none());
}
