// tests/scenarios.rs
// End-to-end scenarios driving `ChatClient` over the in-memory transport.
// Password-import-mismatch (wrong password on identity import) is
// exercised at the unit level in `src/identity.rs`; everything else that
// needs two or more cooperating clients lives here.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chat_core::client::IncomingEvent;
use chat_core::config::ChatClientConfig;
use chat_core::envelope::{signature_preimage, ChatMessage, ConversationType as WireConversationType, EncryptedEnvelope, MessageType, RevokePayload, TextPayload};
use chat_core::identity::Identity;
use chat_core::persistence::MemoryStore;
use chat_core::pubkey_resolver::{InMemoryPublicKeyResolver, PublicKeyResolver};
use chat_core::transport::memory::{MemoryNetwork, MemoryTransport};
use chat_core::transport::{topic_for_direct, topic_for_group, Transport};
use chat_core::ChatClient;

fn collecting_handler() -> (Arc<dyn Fn(IncomingEvent) + Send + Sync>, Arc<Mutex<Vec<IncomingEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let events_clone = Arc::clone(&events);
    let handler = Arc::new(move |event: IncomingEvent| {
        events_clone.lock().unwrap().push(event);
    });
    (handler, events)
}

/// Builds two clients on the same in-memory overlay, each knowing the
/// other's long-term public key in advance (as a real app would after an
/// out-of-band contact exchange).
async fn paired_clients(network: &Arc<MemoryNetwork>) -> (Arc<ChatClient>, Arc<ChatClient>) {
    let alice_identity = Identity::create();
    let bob_identity = Identity::create();

    let alice_resolver = Arc::new(InMemoryPublicKeyResolver::new());
    alice_resolver.register_public_key(bob_identity.user_id().clone(), *bob_identity.public_key());
    let bob_resolver = Arc::new(InMemoryPublicKeyResolver::new());
    bob_resolver.register_public_key(alice_identity.user_id().clone(), *alice_identity.public_key());

    let alice_transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new(network));
    let alice = ChatClient::new(alice_identity, ChatClientConfig::default(), alice_transport, Arc::new(MemoryStore::new()), alice_resolver);
    alice.init().await.unwrap();

    let bob_transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new(network));
    let bob = ChatClient::new(bob_identity, ChatClientConfig::default(), bob_transport, Arc::new(MemoryStore::new()), bob_resolver);
    bob.init().await.unwrap();

    (alice, bob)
}

/// S1: two clients derive a direct conversation independently and
/// exchange a text message.
#[tokio::test]
async fn s1_direct_message_exchange() {
    let network = MemoryNetwork::new();
    let (alice, bob) = paired_clients(&network).await;

    let (alice_handler, alice_events) = collecting_handler();
    let (bob_handler, bob_events) = collecting_handler();
    alice.set_message_handler(alice_handler);
    bob.set_message_handler(bob_handler);

    let conv_a = alice.create_direct_conversation(bob.user_id(), bob.public_key()).await.unwrap();
    let conv_b = bob.create_direct_conversation(alice.user_id(), alice.public_key()).await.unwrap();
    assert_eq!(conv_a, conv_b, "direct conversation id must converge from both sides");

    alice.send_text(&conv_a, "hey bob").await.unwrap();

    let received = bob_events.lock().unwrap();
    assert_eq!(received.len(), 1);
    match &received[0] {
        IncomingEvent::Text { content, sender_id, .. } => {
            assert_eq!(content, "hey bob");
            assert_eq!(sender_id, alice.user_id());
        }
        other => panic!("expected Text event, got {other:?}"),
    }
    assert!(alice_events.lock().unwrap().is_empty(), "sender does not receive its own message back");
}

/// S2: a three-party group created by Alice, joined by Bob and Carol via
/// out-of-band invites, with a message visible to every member.
#[tokio::test]
async fn s2_group_conversation_with_three_members() {
    let network = MemoryNetwork::new();

    let alice_identity = Identity::create();
    let bob_identity = Identity::create();
    let carol_identity = Identity::create();

    let alice_resolver = Arc::new(InMemoryPublicKeyResolver::new());
    alice_resolver.register_public_key(bob_identity.user_id().clone(), *bob_identity.public_key());
    alice_resolver.register_public_key(carol_identity.user_id().clone(), *carol_identity.public_key());

    let bob_resolver = Arc::new(InMemoryPublicKeyResolver::new());
    bob_resolver.register_public_key(alice_identity.user_id().clone(), *alice_identity.public_key());

    let carol_resolver = Arc::new(InMemoryPublicKeyResolver::new());
    carol_resolver.register_public_key(alice_identity.user_id().clone(), *alice_identity.public_key());

    let alice = ChatClient::new(alice_identity, ChatClientConfig::default(), Arc::new(MemoryTransport::new(&network)), Arc::new(MemoryStore::new()), alice_resolver);
    alice.init().await.unwrap();
    let bob = ChatClient::new(bob_identity, ChatClientConfig::default(), Arc::new(MemoryTransport::new(&network)), Arc::new(MemoryStore::new()), bob_resolver);
    bob.init().await.unwrap();
    let carol = ChatClient::new(carol_identity, ChatClientConfig::default(), Arc::new(MemoryTransport::new(&network)), Arc::new(MemoryStore::new()), carol_resolver);
    carol.init().await.unwrap();

    let (bob_handler, bob_events) = collecting_handler();
    bob.set_message_handler(bob_handler);
    let (carol_handler, carol_events) = collecting_handler();
    carol.set_message_handler(carol_handler);

    let group_id = alice.create_group_conversation("project-team").await.unwrap();

    let bob_invite = alice.create_invite(&group_id, bob.public_key()).unwrap();
    bob.join_group_conversation(&bob_invite).await.unwrap();
    alice.add_member(&group_id, bob.user_id().clone()).unwrap();

    let carol_invite = alice.create_invite(&group_id, carol.public_key()).unwrap();
    carol.join_group_conversation(&carol_invite).await.unwrap();
    alice.add_member(&group_id, carol.user_id().clone()).unwrap();

    alice.send_text(&group_id, "welcome both").await.unwrap();

    for events in [&bob_events, &carol_events] {
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], IncomingEvent::Text { content, .. } if content == "welcome both"));
    }
}

/// S3: a non-admin, non-sender group member can publish a revoke (the
/// client does not gatekeep its own sends), but every other member's
/// `can_revoke` evaluation ignores it — the original message is never
/// marked revoked anywhere but at the would-be revoker.
#[tokio::test]
async fn s3_revoke_denied_for_non_admin_non_sender() {
    let network = MemoryNetwork::new();
    let (alice, bob, group_id) = paired_clients_group(&network).await;

    let (bob_handler, bob_events) = collecting_handler();
    bob.set_message_handler(bob_handler);

    // Alice is both creator and sole admin; Bob is a plain member.
    let message_id = alice.send_text(&group_id, "group secret").await.unwrap();

    let got_text = bob_events.lock().unwrap().iter().any(|e| matches!(e, IncomingEvent::Text { .. }));
    assert!(got_text, "bob should have received the text message");

    let result = bob.send_revoke(&group_id, &message_id, "not yours to remove").await;
    assert!(result.is_ok(), "publishing a revoke always succeeds locally");

    let history = alice.fetch_history(&group_id, 0).await.unwrap();
    assert!(
        history.iter().any(|e| matches!(e, IncomingEvent::Text { message_id: id, .. } if id == &message_id)),
        "a revoke from a non-admin non-sender must be ignored, leaving the message intact"
    );
}

/// S4: an admin can revoke another member's message, and the revocation is
/// honored whether the revoke is reconciled live or through history replay.
#[tokio::test]
async fn s4_admin_revoke_is_honored_in_history() {
    let network = MemoryNetwork::new();
    let (alice, bob, group_id) = paired_clients_group(&network).await;

    let message_id = bob.send_text(&group_id, "oops wrong channel").await.unwrap();
    alice.send_revoke(&group_id, &message_id, "off-topic").await.unwrap();

    let history = alice.fetch_history(&group_id, 0).await.unwrap();
    assert!(
        !history.iter().any(|e| matches!(e, IncomingEvent::Text { message_id: id, .. } if id == &message_id)),
        "revoked message must not appear in reconciled history"
    );
}

async fn paired_clients_group(network: &Arc<MemoryNetwork>) -> (Arc<ChatClient>, Arc<ChatClient>, chat_core::ConversationId) {
    let alice_identity = Identity::create();
    let bob_identity = Identity::create();

    let alice_resolver = Arc::new(InMemoryPublicKeyResolver::new());
    alice_resolver.register_public_key(bob_identity.user_id().clone(), *bob_identity.public_key());
    let bob_resolver = Arc::new(InMemoryPublicKeyResolver::new());
    bob_resolver.register_public_key(alice_identity.user_id().clone(), *alice_identity.public_key());

    let alice = ChatClient::new(alice_identity, ChatClientConfig::default(), Arc::new(MemoryTransport::new(network)), Arc::new(MemoryStore::new()), alice_resolver);
    alice.init().await.unwrap();
    let bob = ChatClient::new(bob_identity, ChatClientConfig::default(), Arc::new(MemoryTransport::new(network)), Arc::new(MemoryStore::new()), bob_resolver);
    bob.init().await.unwrap();

    let group_id = alice.create_group_conversation("moderated").await.unwrap();
    let invite = alice.create_invite(&group_id, bob.public_key()).unwrap();
    bob.join_group_conversation(&invite).await.unwrap();
    alice.add_member(&group_id, bob.user_id().clone()).unwrap();

    (alice, bob, group_id)
}

/// S5: replaying the same wire bytes must only ever surface one event.
#[tokio::test]
async fn s5_dedupe_under_replay() {
    let network = MemoryNetwork::new();
    let (alice, bob) = paired_clients(&network).await;

    let received_count = Arc::new(AtomicUsize::new(0));
    let received_count_clone = Arc::clone(&received_count);
    bob.set_message_handler(Arc::new(move |event| {
        if matches!(event, IncomingEvent::Text { .. }) {
            received_count_clone.fetch_add(1, Ordering::SeqCst);
        }
    }));

    let conv = alice.create_direct_conversation(bob.user_id(), bob.public_key()).await.unwrap();
    bob.create_direct_conversation(alice.user_id(), alice.public_key()).await.unwrap();

    alice.send_text(&conv, "only once").await.unwrap();
    assert_eq!(received_count.load(Ordering::SeqCst), 1);

    // Simulate a replayed envelope arriving a second time over the wire by
    // re-publishing the exact bytes the history store already holds.
    let topic = topic_for_direct(conv.as_str());
    let network_probe = MemoryTransport::new(&network);
    network_probe.connect().await.unwrap();
    let history = network_probe.query_history(&topic, 0, 10).await.unwrap();
    let raw = history.last().expect("message was published").payload.clone();
    network_probe.publish(&topic, &raw).await.unwrap();

    assert_eq!(received_count.load(Ordering::SeqCst), 1, "replay must be deduped");
}

/// Hand-builds a signed, AEAD-encrypted `EncryptedEnvelope` the same way
/// `ChatClient::send_raw` does internally, for tests that need to control
/// the exact wire bytes and publish order rather than going through the
/// normal send path.
fn build_envelope(
    sender: &Identity,
    conversation_id: &str,
    conv_type: WireConversationType,
    session_key: &[u8; 32],
    msg_type: MessageType,
    message_id: &str,
    timestamp: u64,
    payload: Vec<u8>,
) -> Vec<u8> {
    let chat_message = ChatMessage {
        message_id: message_id.to_string(),
        sender_id: sender.user_id().to_string(),
        conversation_id: conversation_id.to_string(),
        conv_type,
        msg_type,
        timestamp,
        payload: payload.clone(),
        version: 1,
    };
    let preimage = signature_preimage(message_id, &sender.user_id().to_string(), conversation_id, timestamp, msg_type, &payload);
    let signature = sender.sign(&preimage);
    let plaintext = chat_message.encode();
    let (ciphertext, nonce) = chat_core::crypto::aead_encrypt(session_key, &plaintext).unwrap();
    EncryptedEnvelope {
        encrypted_payload: ciphertext,
        nonce: nonce.to_vec(),
        signature: signature.to_vec(),
        sender_id: sender.user_id().to_string(),
        timestamp,
        version: 1,
    }
    .encode()
}

/// Builds an `Identity` that shares its key material with another identity
/// already handed by value into a `ChatClient` — both are pure functions of
/// the same private scalar, so `user_id()`/`public_key()` agree exactly.
/// Lets a test keep a signing handle for an identity the client consumed.
fn identity_from_same_key(original: &Identity, sk_bytes: &[u8; 32]) -> Identity {
    let copy = Identity::from_private_key(sk_bytes).unwrap();
    assert_eq!(copy.user_id(), original.user_id());
    copy
}

fn fresh_identity_with_bytes() -> (Identity, [u8; 32]) {
    let secp = secp256k1::Secp256k1::new();
    let (sk, _pk) = secp.generate_keypair(&mut rand::thread_rng());
    let bytes = sk.secret_bytes();
    (Identity::from_private_key(&bytes).unwrap(), bytes)
}

/// S4 (literal): a transport page that returns `[REVOKE(target=M1), M1]` —
/// the revoke arriving ahead of the message it targets — still reconciles
/// M1 as revoked. The two-pass scan (§4.7) collects every revoke and every
/// text independent of page order before applying either, so arrival order
/// must not matter.
#[tokio::test]
async fn history_reconciles_revoke_that_arrives_before_its_target() {
    let network = MemoryNetwork::new();

    let (alice_identity, alice_sk) = fresh_identity_with_bytes();
    let (bob_identity, bob_sk) = fresh_identity_with_bytes();
    let alice_signer = identity_from_same_key(&alice_identity, &alice_sk);
    let bob_signer = identity_from_same_key(&bob_identity, &bob_sk);

    let alice_resolver = Arc::new(InMemoryPublicKeyResolver::new());
    alice_resolver.register_public_key(bob_identity.user_id().clone(), *bob_identity.public_key());
    let bob_resolver = Arc::new(InMemoryPublicKeyResolver::new());
    bob_resolver.register_public_key(alice_identity.user_id().clone(), *alice_identity.public_key());

    let alice = ChatClient::new(alice_identity, ChatClientConfig::default(), Arc::new(MemoryTransport::new(&network)), Arc::new(MemoryStore::new()), alice_resolver);
    alice.init().await.unwrap();
    let bob = ChatClient::new(bob_identity, ChatClientConfig::default(), Arc::new(MemoryTransport::new(&network)), Arc::new(MemoryStore::new()), bob_resolver);
    bob.init().await.unwrap();

    let group_id = alice.create_group_conversation("moderated").await.unwrap();
    let invite = alice.create_invite(&group_id, bob.public_key()).unwrap();
    bob.join_group_conversation(&invite).await.unwrap();
    alice.add_member(&group_id, bob.user_id().clone()).unwrap();

    let conv = alice.get_conversation(&group_id).expect("conversation must exist");
    let topic = topic_for_group(group_id.as_str());
    let probe = MemoryTransport::new(&network);
    probe.connect().await.unwrap();

    let target_message_id = "a".repeat(64);

    // Publish the REVOKE first, well before the text message it targets
    // has ever been seen by any client.
    let revoke_bytes = build_envelope(
        &alice_signer,
        group_id.as_str(),
        WireConversationType::Group,
        &conv.session_key,
        MessageType::Revoke,
        &"b".repeat(64),
        1_000,
        RevokePayload { target_message_id: target_message_id.clone(), reason: "pre-empted".into() }.encode(),
    );
    probe.publish(&topic, &revoke_bytes).await.unwrap();

    // The targeted text message, signed by Bob (a plain member), published
    // strictly after the revoke above in transport/page order.
    let text_bytes = build_envelope(
        &bob_signer,
        group_id.as_str(),
        WireConversationType::Group,
        &conv.session_key,
        MessageType::Text,
        &target_message_id,
        500, // earlier timestamp than the revoke, despite arriving second
        TextPayload { content: "will be pre-empted".into() }.encode(),
    );
    probe.publish(&topic, &text_bytes).await.unwrap();

    let history = alice.fetch_history(&group_id, 0).await.unwrap();
    assert!(
        history.iter().any(|e| matches!(e, IncomingEvent::Revoked { message_id, .. } if message_id.as_str() == target_message_id)),
        "a REVOKE that precedes its target in the page must still tombstone it"
    );
    assert!(
        !history.iter().any(|e| matches!(e, IncomingEvent::Text { message_id, .. } if message_id.as_str() == target_message_id)),
        "the tombstoned message must not also surface as live text"
    );
}

/// Invariant 8: applying the same tombstone twice is a no-op — the second
/// application must not change the persisted outcome or emit a different
/// event than the first.
#[tokio::test]
async fn revoke_idempotence() {
    let network = MemoryNetwork::new();
    let (alice, bob, group_id) = paired_clients_group(&network).await;

    let (bob_handler, bob_events) = collecting_handler();
    bob.set_message_handler(bob_handler);

    let message_id = bob.send_text(&group_id, "will be revoked twice").await.unwrap();
    alice.send_revoke(&group_id, &message_id, "first revoke").await.unwrap();
    alice.send_revoke(&group_id, &message_id, "duplicate revoke").await.unwrap();

    let revoked_events = bob_events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, IncomingEvent::Revoked { message_id: id, .. } if id == &message_id))
        .count();
    assert_eq!(revoked_events, 2, "each revoke publish still fans out an event, but...");

    let history = alice.fetch_history(&group_id, 0).await.unwrap();
    let revoked_in_history = history
        .iter()
        .filter(|e| matches!(e, IncomingEvent::Revoked { message_id: id, .. } if id == &message_id))
        .count();
    assert_eq!(revoked_in_history, 1, "...reconciled history state is unchanged by the duplicate");
}
