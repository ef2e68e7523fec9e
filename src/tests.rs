// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end protocol scenarios, driving full handler fleets over a
//! simulated broadcast channel.
use crate::codec::{decode_frame, encode_frame};
use crate::crypto::Rng;
use crate::greet::GreetingState;
use crate::handler::{ProtocolHandler, UiEvent};
use crate::test_utils::handlers;

/// Delivers every queued outbound frame to every handler currently in the
/// channel (the sender included, the broadcast echoes back), until all
/// queues drain. Per-sender order is preserved, as the channel contract
/// guarantees.
fn drain(fleet: &mut [ProtocolHandler], channel: &[&str]) {
    loop {
        let mut packets = Vec::new();
        for handler in fleet.iter_mut() {
            while let Some(packet) = handler.protocol_out_queue.pop_front() {
                packets.push(packet);
            }
        }
        if packets.is_empty() {
            break;
        }
        for packet in packets {
            for handler in fleet.iter_mut() {
                if channel.contains(&handler.id()) {
                    handler.process_message(&packet.from, &packet.message).unwrap();
                }
            }
        }
    }
}

fn assert_converged(fleet: &[ProtocolHandler], members: &[&str]) {
    let reference = fleet
        .iter()
        .find(|handler| handler.id() == members[0])
        .expect("reference member");
    let store = reference.greet_store();
    assert_eq!(reference.state(), GreetingState::Ready);

    for handler in fleet {
        if !members.contains(&handler.id()) {
            continue;
        }
        assert_eq!(handler.state(), GreetingState::Ready, "{}", handler.id());
        let other = handler.greet_store();
        assert_eq!(other.members(), members, "{}", handler.id());
        assert_eq!(other.session_id(), store.session_id(), "{}", handler.id());
        assert_eq!(other.group_key(), store.group_key(), "{}", handler.id());
        // The READY invariant: one nonce and one ephemeral key per member.
        assert_eq!(other.members().len(), other.nonces.len());
        assert_eq!(other.members().len(), other.ephemeral_pub_keys.len());
    }
}

fn assert_queues_empty(fleet: &mut [ProtocolHandler]) {
    for handler in fleet.iter_mut() {
        assert!(handler.protocol_out_queue.is_empty(), "{}", handler.id());
        assert!(handler.message_out_queue.is_empty(), "{}", handler.id());
    }
}

fn position(fleet: &[ProtocolHandler], id: &str) -> usize {
    fleet
        .iter()
        .position(|handler| handler.id() == id)
        .expect("handler present")
}

#[test]
fn five_member_session_with_include_exclude_refresh() {
    let rng = Rng::from_seed([1; 32]);
    let names = ["1", "2", "3", "4", "5", "6", "7"];
    let mut fleet = handlers(&names, &rng);

    // ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
    // Member 1 starts a session with 2.. 5
    // ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~

    let channel = ["1", "2", "3", "4", "5"];
    let others: Vec<String> = ["2", "3", "4", "5"].iter().map(|s| s.to_string()).collect();
    fleet[0].start(&others).unwrap();
    assert_eq!(fleet[0].state(), GreetingState::InitUpflow);

    drain(&mut fleet, &channel);
    assert_converged(&fleet, &channel);

    // ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
    // Member 2 includes members 6 and 7
    // ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~

    let channel = ["1", "2", "3", "4", "5", "6", "7"];
    let idx = position(&fleet, "2");
    fleet[idx]
        .join(&["6".to_string(), "7".to_string()])
        .unwrap();
    assert_eq!(fleet[idx].state(), GreetingState::AuxUpflow);

    drain(&mut fleet, &channel);
    assert_converged(&fleet, &channel);

    // ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
    // Member 3 excludes members 1 and 4
    // ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~

    let idx = position(&fleet, "3");
    fleet[idx]
        .exclude(&["1".to_string(), "4".to_string()])
        .unwrap();
    assert_eq!(fleet[idx].state(), GreetingState::AuxDownflow);

    drain(&mut fleet, &channel);
    let remaining = ["2", "3", "5", "6", "7"];
    assert_converged(&fleet, &remaining);

    // The excluded members saw a member list without themselves and
    // stopped participating.
    assert_eq!(fleet[position(&fleet, "1")].state(), GreetingState::Quit);
    assert_eq!(fleet[position(&fleet, "4")].state(), GreetingState::Quit);

    // ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
    // Member 5 refreshes the group key
    // ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~

    let old_session_id = *fleet[position(&fleet, "5")]
        .greet_store()
        .session_id()
        .unwrap();
    let old_group_key = fleet[position(&fleet, "5")]
        .greet_store()
        .group_key()
        .unwrap()
        .clone();

    let idx = position(&fleet, "5");
    fleet[idx].refresh().unwrap();

    drain(&mut fleet, &remaining);
    assert_converged(&fleet, &remaining);

    // Refresh renews the key but not the session or its members.
    let store = fleet[position(&fleet, "5")].greet_store();
    assert_eq!(store.session_id(), Some(&old_session_id));
    assert_ne!(store.group_key().unwrap(), &old_group_key);

    assert_queues_empty(&mut fleet);
}

#[test]
fn plaintext_triggers_query_and_session_start() {
    let rng = Rng::from_seed([2; 32]);
    let mut fleet = handlers(&["1", "2"], &rng);
    let channel = ["1", "2"];

    // Member 2 receives unencrypted chatter from member 1.
    fleet[1].process_message("1", "Kia ora").unwrap();

    let event = fleet[1].ui_queue.pop_front().unwrap();
    assert_eq!(
        event,
        UiEvent::Info("Received unencrypted message, requesting encryption.".to_string())
    );
    let query = fleet[1].protocol_out_queue.front().unwrap().clone();
    assert!(query.message.starts_with("?mpENCv"));
    assert_eq!(query.to, "1");

    // Member 1 answers the query by starting the key agreement; both
    // converge to READY.
    drain(&mut fleet, &channel);
    assert_converged(&fleet, &channel);
    assert_queues_empty(&mut fleet);
}

#[test]
fn data_message_send_has_fixed_framing_overhead() {
    let rng = Rng::from_seed([3; 32]);
    let mut fleet = handlers(&["orzabal", "smith"], &rng);
    let channel = ["orzabal", "smith"];

    fleet[0].start(&["smith".to_string()]).unwrap();
    drain(&mut fleet, &channel);
    assert_converged(&fleet, &channel);

    fleet[0].send("Shout, shout, let it all out!").unwrap();

    let packet = fleet[0].message_out_queue.pop_front().unwrap();
    assert_eq!(packet.from, "orzabal");
    assert_eq!(packet.to, "");
    // Fixed record layout: 1 hint + 64 signature + 1 version + 1 category +
    // 12 IV + 35 ciphertext bytes, plus six record headers, base64 and
    // framing.
    assert_eq!(packet.message.len(), 192);

    // The peer reads it back.
    fleet[1].process_message("orzabal", &packet.message).unwrap();
    assert_eq!(
        fleet[1].ui_queue.pop_front().unwrap(),
        UiEvent::Message {
            from: "orzabal".to_string(),
            body: "Shout, shout, let it all out!".to_string(),
        }
    );
}

#[test]
fn error_frame_reaches_the_ui_queue() {
    let rng = Rng::from_seed([4; 32]);
    let mut fleet = handlers(&["1"], &rng);

    fleet[0]
        .process_message("x", "?mpENC Error:Hatschi!")
        .unwrap();

    assert_eq!(
        fleet[0].ui_queue.pop_front().unwrap(),
        UiEvent::Error("Error in mpEnc protocol: Hatschi!".to_string())
    );
    assert!(fleet[0].protocol_out_queue.is_empty());
    assert!(fleet[0].message_out_queue.is_empty());
}

#[test]
fn tampered_data_signature_raises_ui_error() {
    let rng = Rng::from_seed([5; 32]);
    let mut fleet = handlers(&["1", "2"], &rng);
    let channel = ["1", "2"];

    fleet[0].start(&["2".to_string()]).unwrap();
    drain(&mut fleet, &channel);
    assert_converged(&fleet, &channel);

    fleet[0].send("secret").unwrap();
    let packet = fleet[0].message_out_queue.pop_front().unwrap();

    // Flip one byte inside the signature record.
    let mut records = decode_frame(&packet.message).unwrap();
    let signature_offset = 4 + 1 + 4;
    records[signature_offset] ^= 0xff;
    let tampered = encode_frame(&records);

    fleet[1].process_message("1", &tampered).unwrap();
    assert_eq!(
        fleet[1].ui_queue.pop_front().unwrap(),
        UiEvent::Error("Signature of received message invalid.".to_string())
    );
}

#[test]
fn last_man_standing_exclude_quits() {
    let rng = Rng::from_seed([6; 32]);
    let mut fleet = handlers(&["1", "2"], &rng);
    let channel = ["1", "2"];

    fleet[0].start(&["2".to_string()]).unwrap();
    drain(&mut fleet, &channel);
    assert_converged(&fleet, &channel);

    // Member 1 excludes member 2 and is alone afterwards.
    fleet[0].exclude(&["2".to_string()]).unwrap();
    assert_eq!(fleet[0].state(), GreetingState::Quit);

    drain(&mut fleet, &channel);
    assert_eq!(fleet[1].state(), GreetingState::Quit);

    // Neither side can send any longer.
    assert!(fleet[0].send("hello?").is_err());
    assert!(fleet[1].send("hello?").is_err());
}

#[test]
fn caller_misuse_is_refused() {
    let rng = Rng::from_seed([7; 32]);
    let mut fleet = handlers(&["1", "2", "3"], &rng);

    // No session yet: everything but start is refused.
    assert!(fleet[0].send("hi").is_err());
    assert!(fleet[0].refresh().is_err());
    assert!(fleet[0].quit().is_err());
    assert!(fleet[0].join(&["2".to_string()]).is_err());
    assert!(fleet[0].exclude(&["2".to_string()]).is_err());

    // Starting with nobody is refused.
    assert!(fleet[0].start(&[]).is_err());

    let channel = ["1", "2", "3"];
    fleet[0]
        .start(&["2".to_string(), "3".to_string()])
        .unwrap();
    drain(&mut fleet, &channel);
    assert_converged(&fleet, &channel);

    // Established: a second start is refused, as are empty, self-directed
    // or unknown membership changes.
    assert!(fleet[0].start(&["2".to_string()]).is_err());
    assert!(fleet[0].join(&[]).is_err());
    assert!(fleet[0].exclude(&[]).is_err());
    assert!(fleet[0].exclude(&["1".to_string()]).is_err());
    assert!(fleet[0].exclude(&["9".to_string()]).is_err());
    assert_eq!(fleet[0].state(), GreetingState::Ready);
}

#[test]
fn upflow_for_another_member_is_a_no_op() {
    let rng = Rng::from_seed([8; 32]);
    let mut fleet = handlers(&["1", "2", "3"], &rng);

    fleet[0]
        .start(&["2".to_string(), "3".to_string()])
        .unwrap();
    let packet = fleet[0].protocol_out_queue.pop_front().unwrap();
    assert_eq!(packet.to, "2");

    // Member 3 sees the upflow addressed to member 2 and stays silent.
    fleet[2].process_message("1", &packet.message).unwrap();
    assert!(fleet[2].protocol_out_queue.is_empty());
    assert_eq!(fleet[2].state(), GreetingState::Null);
    assert!(fleet[2].ui_queue.is_empty());
}

#[test]
fn quit_publishes_the_ephemeral_key() {
    let rng = Rng::from_seed([9; 32]);
    let mut fleet = handlers(&["1", "2"], &rng);
    let channel = ["1", "2"];

    fleet[0].start(&["2".to_string()]).unwrap();
    drain(&mut fleet, &channel);
    assert_converged(&fleet, &channel);

    let published = fleet[0]
        .greet_store()
        .ephemeral_pub_key("1")
        .copied()
        .unwrap();

    fleet[0].quit().unwrap();
    assert_eq!(fleet[0].state(), GreetingState::Quit);

    let packet = fleet[0].protocol_out_queue.pop_front().unwrap();
    let records = decode_frame(&packet.message).unwrap();
    let message = crate::greet::GreetMessage::decode(&records).unwrap();
    let signing_key = message.signing_key.expect("published ephemeral key");
    assert_eq!(signing_key.verifying_key(), published);
}
