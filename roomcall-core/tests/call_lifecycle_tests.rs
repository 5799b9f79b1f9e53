//! Lifecycle tests: placing, ringing, answering, rejecting, hanging
//! up and the invite timers.

mod common;

use common::*;
use roomcall_core::call::CallOpts;
use roomcall_core::signaling::SignalingMessage;
use roomcall_core::types::{
    CallConfig, CallDirection, CallError, CallParty, CallState, HangupReason,
};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn outbound_call_reaches_invite_sent() {
    let h = harness();
    place_outbound(&h).await;

    assert_eq!(h.call.state(), CallState::InviteSent);
    assert_eq!(h.call.direction(), Some(CallDirection::Outbound));
    assert_eq!(h.client.sent_kinds(), vec!["invite"]);

    let invite = h.client.last_of_kind("invite").unwrap();
    assert_eq!(invite.envelope.version, 1);
    assert_eq!(invite.envelope.party_id.as_ref().unwrap().0, LOCAL_DEVICE);
    assert!(!invite.to_device);
    let SignalingMessage::Invite { offer, lifetime, metadata, .. } = invite.envelope.message
    else {
        panic!("not an invite");
    };
    assert_eq!(lifetime, 60_000);
    // the local description is munged for opus DTX before sending
    assert!(offer.sdp.contains("usedtx=1"));
    let metadata = metadata.unwrap();
    let feed = h.call.local_usermedia_feed().unwrap();
    assert!(metadata.contains_key(&feed.stream_id()));
}

#[tokio::test(start_paused = true)]
async fn outbound_call_connects_on_answer() {
    let h = harness();
    connect_outbound(&h, "bob-stream").await;

    assert_eq!(h.call.state(), CallState::Connected);
    assert_eq!(
        h.call.opponent_party_id(),
        Some(Some(roomcall_core::types::PartyId::new(REMOTE_PARTY)))
    );
    assert_eq!(h.call.opponent_user_id().as_deref(), Some(REMOTE_USER));
    assert_eq!(h.call.remote_feeds().len(), 1);
    // the chosen answer is announced to the other ringing devices
    assert!(h.client.last_of_kind("select_answer").is_some());
}

#[tokio::test(start_paused = true)]
async fn invite_times_out_when_unanswered() {
    let h = harness();
    place_outbound(&h).await;
    let mut events = h.call.subscribe();

    tokio::time::sleep(Duration::from_secs(61)).await;

    assert_eq!(h.call.state(), CallState::Ended);
    assert_eq!(h.call.hangup_reason(), Some(HangupReason::InviteTimeout));
    assert_eq!(h.call.hangup_party(), Some(CallParty::Local));
    // the timeout is announced to the other side
    let hangup = h.client.last_of_kind("hangup").unwrap();
    assert_eq!(
        hangup.envelope.message,
        SignalingMessage::Hangup {
            reason: Some(HangupReason::InviteTimeout)
        }
    );
    // and the hangup is surfaced locally too
    let mut saw_hangup_event = false;
    while let Ok(ev) = events.try_recv() {
        if matches!(ev, roomcall_core::types::CallEvent::Hangup { .. }) {
            saw_hangup_event = true;
        }
    }
    assert!(saw_hangup_event);
}

#[tokio::test(start_paused = true)]
async fn inbound_call_rings_and_answers() {
    let h = harness();
    ring_inbound(&h, "bob-stream").await;

    assert_eq!(h.call.state(), CallState::Ringing);
    assert_eq!(h.call.direction(), Some(CallDirection::Inbound));
    assert_eq!(h.call.remote_feeds().len(), 1);

    h.call.answer(None, None).await.unwrap();
    assert_eq!(h.call.state(), CallState::Connecting);
    let answer = h.client.last_of_kind("answer").unwrap();
    let SignalingMessage::Answer { answer: desc, metadata, .. } = answer.envelope.message else {
        panic!("not an answer");
    };
    assert!(desc.sdp.contains("usedtx=1"));
    assert!(metadata.is_some());

    // answering twice does not send a second answer
    h.call.answer(None, None).await.unwrap();
    assert_eq!(
        h.client
            .sent_kinds()
            .iter()
            .filter(|k| **k == "answer")
            .count(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn answer_follows_the_callers_media() {
    // caller sends audio only; we must not answer with video
    let h = harness();
    ring_inbound(&h, "bob-stream").await;

    h.call.answer(Some(true), Some(true)).await.unwrap();
    let feed = h.call.local_usermedia_feed().unwrap();
    assert!(!feed.stream().audio_tracks().is_empty());
    assert!(feed.stream().video_tracks().is_empty());
}

#[tokio::test(start_paused = true)]
async fn answer_falls_back_to_voice_when_camera_fails() {
    let h = harness();
    h.peer.set_remote_streams(vec![roomcall_core::media::MediaStream::with_id(
        "bob-stream".into(),
        vec![
            roomcall_core::media::MediaTrack::new(roomcall_core::media::TrackKind::Audio),
            roomcall_core::media::MediaTrack::new(roomcall_core::media::TrackKind::Video),
        ],
    )]);
    h.call
        .init_with_invite(invite_signal(h.call.call_id(), "bob-stream"))
        .await
        .unwrap();

    h.media.fail_when_video.store(1, std::sync::atomic::Ordering::SeqCst);
    h.call.answer(Some(true), Some(true)).await.unwrap();

    assert_eq!(h.call.state(), CallState::Connecting);
    let feed = h.call.local_usermedia_feed().unwrap();
    assert!(feed.stream().video_tracks().is_empty());
    assert!(!feed.stream().audio_tracks().is_empty());
}

#[tokio::test(start_paused = true)]
async fn ringing_expires_after_remaining_lifetime() {
    let h = harness();
    h.peer
        .set_remote_streams(vec![remote_audio_stream("bob-stream")]);
    // the invite spent 50 s in transit; only 10 s of ring remain
    let mut signal = invite_signal(h.call.call_id(), "bob-stream");
    signal.age = Some(Duration::from_secs(50));
    h.call.init_with_invite(signal).await.unwrap();

    tokio::time::sleep(Duration::from_secs(9)).await;
    assert_eq!(h.call.state(), CallState::Ringing);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.call.state(), CallState::Ended);
    assert_eq!(h.call.hangup_reason(), Some(HangupReason::InviteTimeout));
    assert_eq!(h.call.hangup_party(), Some(CallParty::Remote));
}

#[tokio::test(start_paused = true)]
async fn reject_only_works_while_ringing() {
    let h = harness();
    let err = h.call.reject().await.unwrap_err();
    assert!(matches!(err, CallError::InvalidState { .. }));

    ring_inbound(&h, "bob-stream").await;
    h.call.reject().await.unwrap();

    assert_eq!(h.call.state(), CallState::Ended);
    assert!(h.client.last_of_kind("reject").is_some());
    assert!(h.client.last_of_kind("hangup").is_none());
}

#[tokio::test(start_paused = true)]
async fn reject_degrades_to_hangup_for_version_zero() {
    let h = harness();
    h.peer
        .set_remote_streams(vec![remote_audio_stream("bob-stream")]);
    let signal = signal_from(
        REMOTE_USER,
        None,
        0,
        h.call.call_id(),
        SignalingMessage::Invite {
            offer: offer_description(),
            lifetime: 60_000,
            invitee: None,
            capabilities: Default::default(),
            metadata: None,
        },
    );
    h.call.init_with_invite(signal).await.unwrap();
    assert_eq!(h.call.opponent_version(), Some(0));

    h.call.reject().await.unwrap();
    assert!(h.client.last_of_kind("reject").is_none());
    let hangup = h.client.last_of_kind("hangup").unwrap();
    // user_hangup is suppressed on the wire for version-0 peers
    assert_eq!(
        hangup.envelope.message,
        SignalingMessage::Hangup { reason: None }
    );
}

#[tokio::test(start_paused = true)]
async fn hangup_before_invite_sends_nothing() {
    let h = harness();
    // Fledgling: no invite has gone out, nothing to retract
    h.call.hangup(HangupReason::UserHangup, false).await;
    assert_eq!(h.call.state(), CallState::Ended);
    assert!(h.client.sent.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn hangup_after_connect_sends_reason() {
    let h = harness();
    connect_outbound(&h, "bob-stream").await;

    h.call.hangup(HangupReason::UserHangup, false).await;
    let hangup = h.client.last_of_kind("hangup").unwrap();
    // version-1 peers get the reason even for a plain user hangup
    assert_eq!(
        hangup.envelope.message,
        SignalingMessage::Hangup {
            reason: Some(HangupReason::UserHangup)
        }
    );
    // local media is released
    assert!(!h.media.stopped_streams.lock().is_empty());
    assert!(h.call.feeds().is_empty());
}

#[tokio::test(start_paused = true)]
async fn remote_hangup_terminates_with_remote_party() {
    let h = harness();
    connect_outbound(&h, "bob-stream").await;
    let mut events = h.call.subscribe();

    h.call
        .on_hangup_received(signal_from(
            REMOTE_USER,
            Some(REMOTE_PARTY),
            1,
            h.call.call_id(),
            SignalingMessage::Hangup {
                reason: Some(HangupReason::UserHangup),
            },
        ))
        .await;

    assert_eq!(h.call.state(), CallState::Ended);
    assert_eq!(h.call.hangup_party(), Some(CallParty::Remote));
    let mut saw = false;
    while let Ok(ev) = events.try_recv() {
        if matches!(
            ev,
            roomcall_core::types::CallEvent::Hangup {
                party: CallParty::Remote,
                reason: HangupReason::UserHangup,
            }
        ) {
            saw = true;
        }
    }
    assert!(saw);
}

#[tokio::test(start_paused = true)]
async fn hangup_from_wrong_party_is_ignored_once_connected() {
    let h = harness();
    connect_outbound(&h, "bob-stream").await;

    h.call
        .on_hangup_received(signal_from(
            REMOTE_USER,
            Some("SOMEOTHERDEVICE"),
            1,
            h.call.call_id(),
            SignalingMessage::Hangup { reason: None },
        ))
        .await;
    assert_eq!(h.call.state(), CallState::Connected);
}

#[tokio::test(start_paused = true)]
async fn media_failure_ends_outbound_call() {
    let h = harness();
    h.media
        .fail_user_media
        .store(1, std::sync::atomic::Ordering::SeqCst);

    let err = h.call.place_voice_call().await.unwrap_err();
    assert!(matches!(err, CallError::Terminal { .. }));
    assert_eq!(h.call.state(), CallState::Ended);
    assert_eq!(h.call.hangup_reason(), Some(HangupReason::NoUserMedia));
}

#[tokio::test(start_paused = true)]
async fn call_length_clock_ticks_once_connected() {
    let h = harness();
    connect_outbound(&h, "bob-stream").await;
    let mut events = h.call.subscribe();

    tokio::time::sleep(Duration::from_millis(3100)).await;
    let mut lengths = Vec::new();
    while let Ok(ev) = events.try_recv() {
        if let roomcall_core::types::CallEvent::LengthChanged(secs) = ev {
            lengths.push(secs);
        }
    }
    assert!(!lengths.is_empty());
    assert!(lengths.last().copied().unwrap() >= 3);
}

#[tokio::test(start_paused = true)]
async fn invite_carries_invitee_when_targeted() {
    let mut opts = CallOpts::new(ROOM);
    opts.invitee = Some(REMOTE_USER.to_owned());
    let h = harness_with(opts);
    place_outbound(&h).await;

    let invite = h.client.last_of_kind("invite").unwrap();
    let SignalingMessage::Invite { invitee, .. } = invite.envelope.message else {
        panic!("not an invite");
    };
    assert_eq!(invitee.as_deref(), Some(REMOTE_USER));
}

#[tokio::test(start_paused = true)]
async fn to_device_envelopes_carry_sequence_numbers() {
    let mut opts = CallOpts::new(ROOM);
    opts.invitee = Some(REMOTE_USER.to_owned());
    opts.opponent_device_id = Some(REMOTE_PARTY.to_owned());
    opts.opponent_session_id = Some("bob-session".to_owned());
    let h = harness_with(opts);
    place_outbound(&h).await;
    h.call.hangup(HangupReason::UserHangup, false).await;

    let sent = h.client.sent.lock().clone();
    assert!(sent.iter().all(|s| s.to_device));
    let seqs: Vec<u64> = sent.iter().map(|s| s.envelope.seq.unwrap()).collect();
    let mut sorted = seqs.clone();
    sorted.sort_unstable();
    assert_eq!(seqs, sorted);
    assert_eq!(seqs[0], 0);
    assert!(sent.iter().all(|s| s.envelope.message_id.is_some()));
    assert!(sent
        .iter()
        .all(|s| s.envelope.dest_session_id.as_deref() == Some("bob-session")));
}

#[tokio::test(start_paused = true)]
async fn reject_before_any_invite_is_ignored() {
    // a reject can arrive before the invite when history is replayed
    let h = harness();
    h.call
        .on_reject_received(signal_from(
            REMOTE_USER,
            Some(REMOTE_PARTY),
            1,
            h.call.call_id(),
            SignalingMessage::Reject { reason: None },
        ))
        .await;
    // no direction yet, so the reject is ignored
    assert_eq!(h.call.state(), CallState::Fledgling);
}

#[tokio::test(start_paused = true)]
async fn init_with_hangup_seeds_an_ended_call() {
    // room history replayed newest-first: the hangup is seen before
    // the invite, so the call object starts out already over
    let h = harness();
    h.call.init_with_hangup();
    assert_eq!(h.call.state(), CallState::Ended);
    assert!(h.client.sent.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn invite_without_media_is_refused_by_default() {
    let h = harness();
    // the offer carries no usable tracks
    h.peer.set_remote_streams(Vec::new());
    let result = h
        .call
        .init_with_invite(invite_signal(h.call.call_id(), "bob-stream"))
        .await;

    assert!(result.is_err());
    assert_eq!(h.call.state(), CallState::Ended);
}

#[tokio::test(start_paused = true)]
async fn allow_no_media_permits_data_channel_only_calls() {
    let h = harness_with_config(CallConfig {
        allow_no_media: true,
        ..CallConfig::default()
    });
    h.peer.set_remote_streams(Vec::new());
    h.call
        .init_with_invite(invite_signal(h.call.call_id(), "bob-stream"))
        .await
        .unwrap();

    assert_eq!(h.call.state(), CallState::Ringing);
}

#[tokio::test(start_paused = true)]
async fn config_invite_lifetime_is_respected() {
    let h = harness_with_config(CallConfig {
        invite_lifetime: Duration::from_secs(5),
        ..CallConfig::default()
    });
    place_outbound(&h).await;

    let invite = h.client.last_of_kind("invite").unwrap();
    let SignalingMessage::Invite { lifetime, .. } = invite.envelope.message else {
        panic!("not an invite");
    };
    assert_eq!(lifetime, 5_000);

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(h.call.state(), CallState::Ended);
    assert_eq!(h.call.hangup_reason(), Some(HangupReason::InviteTimeout));
}
