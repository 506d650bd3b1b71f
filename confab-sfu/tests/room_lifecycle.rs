//! Room, participant and producer/consumer lifecycle tests
//!
//! Run with: cargo test -p confab-sfu --test room_lifecycle

mod common;

use common::{count, opus_parameters, server, server_with, vp8_parameters, Client};
use confab_sfu::{MediaKind, ParticipantId, RoomId, ServerEvent, SfuConfig, SfuError};
use serde_json::Value;

#[tokio::test]
async fn test_late_joiner_gets_one_paused_consumer() {
    let (server, _engine) = server(1).await;

    let alice = Client::join(&server, "r1", "alice").await;
    alice.declare_capabilities().await;
    let (video, report) = alice
        .room
        .produce(&alice.id, MediaKind::Video, vp8_parameters(), Value::Null)
        .await
        .unwrap();
    assert_eq!(report.unwrap().outcomes.len(), 0);

    let mut bob = Client::join(&server, "r1", "bob").await;
    let report = bob.declare_capabilities().await;
    assert_eq!(report.created(), 1);
    assert_eq!(report.failed(), 0);

    let events = bob.drain().await;
    let new_consumers: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            ServerEvent::NewConsumer {
                producer_id,
                participant_id,
                consumer_paused,
                ..
            } => Some((*producer_id, participant_id.clone(), *consumer_paused)),
            _ => None,
        })
        .collect();
    assert_eq!(new_consumers, vec![(video.producer_id, alice.id.clone(), true)]);

    let existing = events.iter().find_map(|event| match event {
        ServerEvent::ExistingParticipants { participants } => Some(participants.clone()),
        _ => None,
    });
    let existing = existing.unwrap();
    assert_eq!(existing.len(), 1);
    assert_eq!(existing[0].participant_id, alice.id);
    assert_eq!(existing[0].producers[0].producer_id, video.producer_id);
}

#[tokio::test]
async fn test_consumers_wait_for_capabilities() {
    let (server, _engine) = server(1).await;

    let alice = Client::join(&server, "r1", "alice").await;
    alice
        .room
        .produce(&alice.id, MediaKind::Audio, opus_parameters(), Value::Null)
        .await
        .unwrap();

    let mut bob = Client::join(&server, "r1", "bob").await;
    let events = bob.drain().await;
    assert_eq!(
        count(&events, |e| matches!(e, ServerEvent::NewConsumer { .. })),
        0
    );
    assert!(bob.participant.consumers().is_empty());

    bob.declare_capabilities().await;
    assert_eq!(bob.participant.consumers().len(), 1);
}

#[tokio::test]
async fn test_new_producer_fans_out_to_declared_participants() {
    let (server, _engine) = server(1).await;

    let alice = Client::join(&server, "r1", "alice").await;
    let bob = Client::join(&server, "r1", "bob").await;
    bob.declare_capabilities().await;
    let carol = Client::join(&server, "r1", "carol").await;

    let (_, report) = alice
        .room
        .produce(&alice.id, MediaKind::Video, vp8_parameters(), Value::Null)
        .await
        .unwrap();
    let report = report.unwrap();

    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(report.outcomes[0].participant_id, bob.id);
    assert_eq!(bob.participant.consumers().len(), 1);
    assert!(carol.participant.consumers().is_empty());
}

#[tokio::test]
async fn test_one_producer_per_kind() {
    let (server, _engine) = server(1).await;
    let alice = Client::join(&server, "r1", "alice").await;

    let (first, second) = tokio::join!(
        alice
            .room
            .produce(&alice.id, MediaKind::Video, vp8_parameters(), Value::Null),
        alice
            .room
            .produce(&alice.id, MediaKind::Video, vp8_parameters(), Value::Null),
    );
    let (first, first_report) = first.unwrap();
    let (second, second_report) = second.unwrap();

    assert_eq!(first.producer_id, second.producer_id);
    assert!(first_report.is_some() ^ second_report.is_some());
    assert_eq!(alice.participant.producers().len(), 1);

    let (screen, _) = alice
        .room
        .produce(&alice.id, MediaKind::ScreenVideo, vp8_parameters(), Value::Null)
        .await
        .unwrap();
    assert_ne!(screen.producer_id, first.producer_id);
    assert_eq!(alice.participant.producers().len(), 2);
}

#[tokio::test]
async fn test_create_consumer_is_idempotent() {
    let (server, _engine) = server(1).await;

    let alice = Client::join(&server, "r1", "alice").await;
    let (video, _) = alice
        .room
        .produce(&alice.id, MediaKind::Video, vp8_parameters(), Value::Null)
        .await
        .unwrap();
    let bob = Client::join(&server, "r1", "bob").await;
    bob.participant
        .set_rtp_capabilities(bob.room.rtp_capabilities())
        .unwrap();

    let (first, second) = tokio::join!(
        bob.room.create_consumer(&bob.participant, &video, &alice.id),
        bob.room.create_consumer(&bob.participant, &video, &alice.id),
    );
    let first = first.unwrap().unwrap();
    let second = second.unwrap().unwrap();
    assert_eq!(first.consumer_id, second.consumer_id);
    assert_eq!(bob.participant.consumers().len(), 1);

    let usage = server.workers()[0].stats(1).await.resource_usage.unwrap();
    assert_eq!(usage.consumers, 1);
}

#[tokio::test]
async fn test_consumer_resumes_only_on_request() {
    let (server, _engine) = server(1).await;

    let alice = Client::join(&server, "r1", "alice").await;
    alice
        .room
        .produce(&alice.id, MediaKind::Video, vp8_parameters(), Value::Null)
        .await
        .unwrap();
    let mut bob = Client::join(&server, "r1", "bob").await;
    bob.declare_capabilities().await;
    bob.drain().await;

    let consumer = bob.participant.consumers().remove(0);
    assert!(consumer.paused);

    bob.participant.resume_consumer(consumer.consumer_id).await.unwrap();
    let events = bob.drain().await;
    assert_eq!(
        count(&events, |e| matches!(e, ServerEvent::ConsumerResumed { .. })),
        1
    );
    assert!(!bob.participant.consumers()[0].paused);
}

#[tokio::test]
async fn test_producer_close_ends_consumers() {
    let (server, _engine) = server(1).await;

    let alice = Client::join(&server, "r1", "alice").await;
    let mut bob = Client::join(&server, "r1", "bob").await;
    bob.declare_capabilities().await;
    let (video, _) = alice
        .room
        .produce(&alice.id, MediaKind::Video, vp8_parameters(), Value::Null)
        .await
        .unwrap();
    assert_eq!(bob.participant.consumers().len(), 1);
    bob.drain().await;

    alice.room.close_producer(&alice.id, MediaKind::Video).await.unwrap();

    let events = bob.drain().await;
    assert_eq!(
        count(&events, |e| matches!(
            e,
            ServerEvent::ConsumerProducerClosed { producer_id, .. } if *producer_id == video.producer_id
        )),
        1
    );
    assert_eq!(
        count(&events, |e| matches!(e, ServerEvent::ProducerClosed { .. })),
        1
    );
    assert!(bob.participant.consumers().is_empty());

    let again = bob
        .room
        .create_consumer(&bob.participant, &video, &alice.id)
        .await
        .unwrap();
    assert!(again.is_none());
}

#[tokio::test]
async fn test_producer_pause_is_pushed() {
    let (server, _engine) = server(1).await;

    let alice = Client::join(&server, "r1", "alice").await;
    let mut bob = Client::join(&server, "r1", "bob").await;
    bob.declare_capabilities().await;
    alice
        .room
        .produce(&alice.id, MediaKind::Audio, opus_parameters(), Value::Null)
        .await
        .unwrap();
    bob.drain().await;

    alice.room.pause_producer(&alice.id, MediaKind::Audio).await.unwrap();
    alice.room.pause_producer(&alice.id, MediaKind::Audio).await.unwrap();

    let events = bob.drain().await;
    assert_eq!(
        count(&events, |e| matches!(
            e,
            ServerEvent::ProducerStateChanged { paused: true, kind: MediaKind::Audio, .. }
        )),
        1
    );
    assert_eq!(
        count(&events, |e| matches!(e, ServerEvent::ConsumerProducerPaused { .. })),
        1
    );
    assert!(bob.participant.consumers()[0].producer_paused);
}

#[tokio::test]
async fn test_leaving_participant_closes_consumers_once() {
    let (server, _engine) = server(1).await;

    let alice = Client::join(&server, "r1", "alice").await;
    alice
        .room
        .produce(&alice.id, MediaKind::Video, vp8_parameters(), Value::Null)
        .await
        .unwrap();
    let mut bob = Client::join(&server, "r1", "bob").await;
    bob.declare_capabilities().await;
    bob.drain().await;

    alice.room.remove_participant(&alice.id).await.unwrap();

    let events = bob.drain().await;
    assert_eq!(
        count(&events, |e| matches!(e, ServerEvent::ConsumerProducerClosed { .. })),
        1
    );
    assert_eq!(
        count(&events, |e| matches!(
            e,
            ServerEvent::ParticipantLeft { participant_id } if *participant_id == alice.id
        )),
        1
    );
    let remaining: Vec<ParticipantId> = bob
        .room
        .participants()
        .iter()
        .map(|p| p.id().clone())
        .collect();
    assert_eq!(remaining, vec![bob.id.clone()]);
    assert!(bob.participant.consumers().is_empty());
}

#[tokio::test]
async fn test_empty_room_is_closed_and_evicted() {
    let (server, _engine) = server(1).await;

    let alice = Client::join(&server, "r1", "alice").await;
    let bob = Client::join(&server, "r1", "bob").await;
    let room = alice.room.clone();

    room.remove_participant(&alice.id).await.unwrap();
    assert!(!room.is_closed());
    room.remove_participant(&bob.id).await.unwrap();

    assert!(room.is_closed());
    assert_eq!(room.participant_count(), 0);
    assert!(server.room(&RoomId::from("r1")).is_none());
    assert_eq!(server.room_count(), 0);

    let fresh = server.get_or_create_room(&RoomId::from("r1")).await.unwrap();
    assert!(!std::sync::Arc::ptr_eq(&fresh, &room));
}

#[tokio::test]
async fn test_closed_room_rejects_participants() {
    let (server, _engine) = server(1).await;
    let alice = Client::join(&server, "r1", "alice").await;
    let transport = server.create_webrtc_transport(alice.room.id()).await.unwrap();

    alice.room.close().await;
    alice.room.close().await;
    assert!(alice.participant.is_closed());

    let result = alice
        .room
        .add_participant(
            ParticipantId::from("bob"),
            confab_sfu::UserInfo::default(),
            alice.channel.clone(),
            None,
            transport.clone(),
        )
        .await;
    assert!(matches!(result, Err(SfuError::RoomClosed(_))));
    assert!(transport.closed());
}

#[tokio::test]
async fn test_room_capacity() {
    let (server, _engine) = server_with(SfuConfig {
        num_workers: Some(1),
        max_participants_per_room: 1,
        ..SfuConfig::default()
    })
    .await;

    let _alice = Client::join(&server, "r1", "alice").await;
    let room = server.room(&RoomId::from("r1")).unwrap();
    let transport = server.create_webrtc_transport(room.id()).await.unwrap();
    let (channel, _rx) = confab_sfu::SignalingChannel::pair(ParticipantId::from("bob"), 8);

    let result = room
        .add_participant(
            ParticipantId::from("bob"),
            confab_sfu::UserInfo::default(),
            channel,
            None,
            transport,
        )
        .await;
    let err = result.err().unwrap();
    assert!(matches!(err, SfuError::RoomFull(_)));
    assert_eq!(err.kind(), confab_sfu::ErrorKind::ResourceExhaustion);
}

#[tokio::test]
async fn test_join_is_announced_to_others() {
    let (server, _engine) = server(1).await;
    let mut alice = Client::join(&server, "r1", "alice").await;
    alice.drain().await;

    let bob = Client::join(&server, "r1", "bob").await;
    let events = alice.drain().await;
    assert_eq!(
        count(&events, |e| matches!(
            e,
            ServerEvent::ParticipantJoined { participant_id, .. } if *participant_id == bob.id
        )),
        1
    );
}

#[tokio::test]
async fn test_close_if_empty_only_closes_unoccupied_rooms() {
    let (server, _engine) = server(1).await;

    let idle = server.get_or_create_room(&RoomId::from("idle")).await.unwrap();
    assert!(idle.close_if_empty().await);
    assert!(!idle.close_if_empty().await);
    assert!(idle.is_closed());
    assert!(server.room(&RoomId::from("idle")).is_none());

    let alice = Client::join(&server, "busy", "alice").await;
    assert!(!alice.room.close_if_empty().await);
    assert!(!alice.room.is_closed());
    assert_eq!(server.room_count(), 1);
}

#[tokio::test]
async fn test_same_id_over_another_connection_is_refused() {
    let (server, _engine) = server(1).await;
    let alice = Client::join(&server, "r1", "alice").await;
    let transport = server.create_webrtc_transport(alice.room.id()).await.unwrap();
    let (other_channel, _rx) = confab_sfu::SignalingChannel::pair(alice.id.clone(), 8);

    let result = alice
        .room
        .add_participant(
            alice.id.clone(),
            confab_sfu::UserInfo::default(),
            other_channel,
            Some(confab_sfu::TransportDirection::Recv),
            transport.clone(),
        )
        .await;
    let err = result.err().unwrap();
    assert!(matches!(err, SfuError::AlreadyConnected(_)));
    assert_eq!(err.kind(), confab_sfu::ErrorKind::ProtocolViolation);
    assert!(transport.closed());
    assert!(!alice.participant.is_closed());
}
