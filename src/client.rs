// src/client.rs
// ChatClient orchestrator (C7): wires C1-C6 together into the public send
// and receive pipelines, revoke handling with out-of-order tombstone
// staging, history reconciliation, and the subscription registry.
//
// Shared state is guarded by plain `std::sync::Mutex`es rather than
// `tokio::sync::Mutex` — nothing here holds a lock across an `.await`
// point, so the blocking mutex is both simpler and cheaper. Where more
// than one map must be locked together the order is always
// conversation map -> subscription registry -> dedupe cache, to rule out
// lock-order inversions between `send_message` and the receive callback.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use secp256k1::PublicKey;

use crate::config::ChatClientConfig;
use crate::conversation::{Conversation, ConversationRecord, ConversationType, GroupInvite};
use crate::dedupe::DedupeCache;
use crate::envelope::{ChatMessage, EncryptedEnvelope, RevokePayload, TextPayload};
use crate::error::{ChatError, Result};
use crate::identity::Identity;
use crate::ids::{ConversationId, MessageId, UserId};
use crate::persistence::{get_json, set_json, Store};
use crate::pubkey_resolver::PublicKeyResolver;
use crate::transport::{
    reliable_publish, topic_for_direct, topic_for_group, topic_for_system, ConnectionState,
    HistoricalMessage, SubscriptionToken, Transport,
};

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch").as_millis() as u64
}

/// `hex(SHA-256(ascii_digits(timestamp_ms) || sender_id || random16))`.
fn new_message_id(timestamp: u64, sender_id: &UserId) -> MessageId {
    let mut random16 = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut random16);

    let mut preimage = Vec::new();
    preimage.extend_from_slice(timestamp.to_string().as_bytes());
    preimage.extend_from_slice(sender_id.as_str().as_bytes());
    preimage.extend_from_slice(&random16);

    MessageId::from_validated(hex::encode(crate::crypto::sha256(&preimage)))
}

/// Control-plane payloads for the system-topic message types. TEXT and
/// REVOKE carry their own binary payload schema (`TextPayload`,
/// `RevokePayload`); the group-lifecycle types piggyback JSON since they
/// travel over the per-user system topic rather than a shared session key.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind")]
pub enum ControlPayload {
    KeyExchange { ephemeral_public_key: String },
    GroupInvite { invite: GroupInvite },
    GroupJoin { conversation_id: String, user_id: String },
    GroupLeave { conversation_id: String, user_id: String },
    GroupKeyUpdate { conversation_id: String, key_version: u32, encrypted_key: String },
}

/// Lifecycle status of a delivered/stored message (§4.7 send-step-8's
/// `status=sent`, and the tombstoned counterpart once a revoke lands).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum MessageStatus {
    Sent,
    Revoked,
}

/// Events delivered to the caller's message handler after the receive
/// pipeline has decrypted, deduped, and (where possible) verified an
/// inbound message. `verified` is `false` whenever the sender's public key
/// is unresolved or the signature fails to check out — per §6/§4.7 such a
/// message is still delivered, never silently dropped or silently treated
/// as authentic.
#[derive(Debug, Clone)]
pub enum IncomingEvent {
    Text { conversation_id: ConversationId, message_id: MessageId, sender_id: UserId, content: String, timestamp: u64, verified: bool },
    Revoked { conversation_id: ConversationId, message_id: MessageId },
    GroupInvite { invite: GroupInvite },
    GroupJoin { conversation_id: ConversationId, user_id: UserId },
    GroupLeave { conversation_id: ConversationId, user_id: UserId },
    GroupKeyUpdate { conversation_id: ConversationId, key_version: u32 },
}

struct StoredMessage {
    conversation_id: ConversationId,
    sender_id: UserId,
    content: String,
    timestamp: u64,
    verified: bool,
    status: MessageStatus,
}

/// Persisted shape of a message (§6's `message:<cid>:<mid>` key).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct MessageRecord {
    sender_id: String,
    content: String,
    timestamp: u64,
    verified: bool,
    status: MessageStatus,
}

impl From<&StoredMessage> for MessageRecord {
    fn from(m: &StoredMessage) -> Self {
        MessageRecord {
            sender_id: m.sender_id.to_string(),
            content: m.content.clone(),
            timestamp: m.timestamp,
            verified: m.verified,
            status: m.status,
        }
    }
}

/// Persisted shape of a revoke tombstone (§3's Revoke record, `revoked:<mid>` key).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct RevokeRecord {
    revoker_id: String,
    reason: String,
    revoked_at: u64,
}

struct SubscriptionEntry {
    token: SubscriptionToken,
    refcount: u32,
}

pub struct ChatClient {
    identity: Identity,
    config: ChatClientConfig,
    transport: Arc<dyn Transport>,
    store: Arc<dyn Store>,
    resolver: Arc<dyn PublicKeyResolver>,

    conversations: Mutex<HashMap<ConversationId, Conversation>>,
    subscriptions: Mutex<HashMap<ConversationId, SubscriptionEntry>>,
    dedupe: Mutex<DedupeCache>,

    messages: Mutex<HashMap<MessageId, StoredMessage>>,
    /// Revoke requests staged because the target message hadn't arrived
    /// yet: `target_message_id -> (revoker, reason)`.
    pending_revokes: Mutex<HashMap<MessageId, (UserId, String)>>,

    handler: Mutex<Option<Arc<dyn Fn(IncomingEvent) + Send + Sync>>>,
}

impl ChatClient {
    pub fn new(
        identity: Identity,
        config: ChatClientConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn Store>,
        resolver: Arc<dyn PublicKeyResolver>,
    ) -> Arc<Self> {
        let dedupe = DedupeCache::new(config.dedupe_ttl, config.dedupe_capacity);
        Arc::new(ChatClient {
            identity,
            config,
            transport,
            store,
            resolver,
            conversations: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            dedupe: Mutex::new(dedupe),
            messages: Mutex::new(HashMap::new()),
            pending_revokes: Mutex::new(HashMap::new()),
            handler: Mutex::new(None),
        })
    }

    pub fn user_id(&self) -> &UserId {
        self.identity.user_id()
    }

    pub fn public_key(&self) -> &PublicKey {
        self.identity.public_key()
    }

    pub fn set_message_handler(&self, handler: Arc<dyn Fn(IncomingEvent) + Send + Sync>) {
        *self.handler.lock().unwrap_or_else(|p| p.into_inner()) = Some(handler);
    }

    /// Connects the transport (bounded by `config.connect_timeout`) and
    /// subscribes to this user's own system topic for invites/control
    /// messages.
    pub async fn init(self: &Arc<Self>) -> Result<()> {
        tokio::time::timeout(self.config.connect_timeout, self.transport.connect())
            .await
            .map_err(|_| ChatError::ConnectTimeout)??;

        // a client always trivially knows its own public key, and needs it
        // registered to verify its own signatures back out of history.
        self.resolver.register_public_key(self.identity.user_id().clone(), *self.identity.public_key());

        let topic = topic_for_system(self.identity.user_id().as_str());
        let client = Arc::clone(self);
        let token = self
            .transport
            .subscribe(&topic, Arc::new(move |data| client.on_envelope_bytes(&data)))
            .await?;
        self.subscriptions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(self.system_conversation_key(), SubscriptionEntry { token, refcount: 1 });

        self.load_persisted_conversations().await?;
        Ok(())
    }

    /// Unsubscribes everything and disconnects the transport.
    pub async fn destroy(self: &Arc<Self>) -> Result<()> {
        let entries: Vec<SubscriptionToken> = {
            let mut subs = self.subscriptions.lock().unwrap_or_else(|p| p.into_inner());
            subs.drain().map(|(_, e)| e.token).collect()
        };
        for token in entries {
            self.transport.unsubscribe(token).await?;
        }
        self.transport.disconnect().await
    }

    /// A synthetic conversation id used only as this client's local
    /// bookkeeping key for its own system-topic subscription entry; it is
    /// never published on the wire.
    fn system_conversation_key(&self) -> ConversationId {
        let hash = crate::crypto::sha256(b"system-topic-subscription-key");
        ConversationId::from_validated(hex::encode(&hash[..16]))
    }

    // ------------------------------------------------------------- persistence ----
    // Key schema per §6: identity:<uid>, conversation:<cid>, message:<cid>:<mid>,
    // revoked:<mid>, deleted:<mid>, processed:<mid>. Persistence failures here are
    // logged, not propagated: a backend hiccup must not abort an otherwise
    // successful send or receive.

    fn persist_conversation(&self, conv: &Conversation) {
        self.persist_record(&conv.to_record());
    }

    fn persist_record(&self, record: &ConversationRecord) {
        let key = format!("conversation:{}", record.id);
        if let Err(e) = set_json(&*self.store, &key, record) {
            log::warn!("failed to persist conversation {}: {e}", record.id);
        }
    }

    fn persist_message(&self, conversation_id: &ConversationId, message_id: &MessageId, stored: &StoredMessage) {
        let key = format!("message:{conversation_id}:{message_id}");
        if let Err(e) = set_json(&*self.store, &key, &MessageRecord::from(stored)) {
            log::warn!("failed to persist message {message_id}: {e}");
        }
        if let Err(e) = self.store.set(&format!("processed:{message_id}"), "1") {
            log::warn!("failed to mark message {message_id} processed: {e}");
        }
    }

    fn persist_revoked(&self, conversation_id: &ConversationId, message_id: &MessageId, revoker: &UserId, reason: &str) {
        let record = RevokeRecord { revoker_id: revoker.to_string(), reason: reason.to_string(), revoked_at: now_ms() };
        if let Err(e) = set_json(&*self.store, &format!("revoked:{message_id}"), &record) {
            log::warn!("failed to persist revoke tombstone for {message_id}: {e}");
        }
        let key = format!("message:{conversation_id}:{message_id}");
        if let Ok(Some(mut existing)) = get_json::<MessageRecord>(&*self.store, &key) {
            existing.status = MessageStatus::Revoked;
            let _ = set_json(&*self.store, &key, &existing);
        }
    }

    /// Whether a tombstone for `message_id` has already been persisted,
    /// independent of whether the original message has arrived yet (used to
    /// reconcile state across a restart, when `pending_revokes` is empty).
    pub fn is_revoked_in_store(&self, message_id: &MessageId) -> bool {
        matches!(self.store.get(&format!("revoked:{message_id}")), Ok(Some(_)))
    }

    /// Marks a message as hidden from this client only (§6's `deleted:<mid>`
    /// key) — a local-only operation with no wire effect, distinct from a
    /// REVOKE, which every member observes.
    pub fn delete_message_locally(&self, message_id: &MessageId) -> Result<()> {
        self.store.set(&format!("deleted:{message_id}"), "1")?;
        self.messages.lock().unwrap_or_else(|p| p.into_inner()).remove(message_id);
        Ok(())
    }

    /// Reloads every `conversation:<cid>` record from the store into
    /// memory and resubscribes to its topic, e.g. after restarting a
    /// client against a durable backend. Conversations created fresh this
    /// session are not overwritten.
    pub async fn load_persisted_conversations(self: &Arc<Self>) -> Result<usize> {
        let mut ids = Vec::new();
        for key in self.store.list("conversation:")? {
            let Some(record) = get_json::<ConversationRecord>(&*self.store, &key)? else { continue };
            let conv = Conversation::from_record(&record)?;
            let id = conv.id.clone();
            let mut convs = self.conversations.lock().unwrap_or_else(|p| p.into_inner());
            let is_new = !convs.contains_key(&id);
            convs.entry(id.clone()).or_insert(conv);
            drop(convs);
            if is_new {
                ids.push(id);
            }
        }
        for id in &ids {
            self.subscribe_conversation(id).await?;
        }
        Ok(ids.len())
    }

    /// Persists this identity as a password-encrypted export under
    /// `identity:<uid>` (§6). Out of core scope is an at-rest *file*
    /// format (§1's non-goal); this just routes the existing JSON export
    /// through the generic `Store` contract.
    pub fn persist_identity(&self, password: &str) -> Result<()> {
        let json = self.identity.export(password)?;
        self.store.set(&format!("identity:{}", self.identity.user_id()), &json)
    }

    /// Loads and decrypts a previously persisted identity from `store`.
    pub fn load_identity(store: &dyn Store, user_id: &UserId, password: &str) -> Result<Identity> {
        let json = store
            .get(&format!("identity:{user_id}"))?
            .ok_or_else(|| ChatError::Persistence(format!("no identity stored for {user_id}")))?;
        Identity::import(&json, password)
    }

    // ---------------------------------------------------------- conversations ----

    pub async fn create_direct_conversation(self: &Arc<Self>, peer_id: &UserId, peer_pk: &PublicKey) -> Result<ConversationId> {
        let conv = Conversation::create_direct(&self.identity, peer_id, peer_pk);
        let id = conv.id.clone();
        self.persist_conversation(&conv);
        self.conversations.lock().unwrap_or_else(|p| p.into_inner()).insert(id.clone(), conv);
        self.subscribe_conversation(&id).await?;
        Ok(id)
    }

    pub async fn create_group_conversation(self: &Arc<Self>, name: impl Into<String>) -> Result<ConversationId> {
        let conv = Conversation::create_group(name, self.identity.user_id());
        let id = conv.id.clone();
        self.persist_conversation(&conv);
        self.conversations.lock().unwrap_or_else(|p| p.into_inner()).insert(id.clone(), conv);
        self.subscribe_conversation(&id).await?;
        Ok(id)
    }

    pub async fn join_group_conversation(self: &Arc<Self>, invite: &GroupInvite) -> Result<ConversationId> {
        let conv = Conversation::join_group(invite, self.identity.user_id(), &self.identity)?;
        let id = conv.id.clone();
        self.persist_conversation(&conv);
        self.conversations.lock().unwrap_or_else(|p| p.into_inner()).insert(id.clone(), conv);
        self.subscribe_conversation(&id).await?;
        Ok(id)
    }

    /// Builds an ECIES-wrapped invite for `invitee_pk` to join a group this
    /// client already belongs to. Delivery of the resulting `GroupInvite`
    /// is out-of-band (§6); the caller decides how to get it to the invitee.
    pub fn create_invite(&self, conversation_id: &ConversationId, invitee_pk: &PublicKey) -> Result<GroupInvite> {
        let convs = self.conversations.lock().unwrap_or_else(|p| p.into_inner());
        let conv = convs.get(conversation_id).ok_or_else(|| ChatError::ConversationNotFound(conversation_id.to_string()))?;
        conv.create_invite(invitee_pk)
    }

    /// Local roster bookkeeping after an out-of-band invite is accepted;
    /// does not itself notify other members (pair with publishing a
    /// `ControlPayload::GroupJoin` if that's desired).
    pub fn add_member(&self, conversation_id: &ConversationId, user: UserId) -> Result<()> {
        let record = {
            let mut convs = self.conversations.lock().unwrap_or_else(|p| p.into_inner());
            let conv = convs.get_mut(conversation_id).ok_or_else(|| ChatError::ConversationNotFound(conversation_id.to_string()))?;
            conv.add_member(user);
            conv.to_record()
        };
        self.persist_record(&record);
        Ok(())
    }

    pub fn remove_member(&self, conversation_id: &ConversationId, user: &UserId) -> Result<()> {
        let record = {
            let mut convs = self.conversations.lock().unwrap_or_else(|p| p.into_inner());
            let conv = convs.get_mut(conversation_id).ok_or_else(|| ChatError::ConversationNotFound(conversation_id.to_string()))?;
            conv.remove_member(user);
            conv.to_record()
        };
        self.persist_record(&record);
        Ok(())
    }

    pub fn set_admin(&self, conversation_id: &ConversationId, user: &UserId, is_admin: bool) -> Result<()> {
        let record = {
            let mut convs = self.conversations.lock().unwrap_or_else(|p| p.into_inner());
            let conv = convs.get_mut(conversation_id).ok_or_else(|| ChatError::ConversationNotFound(conversation_id.to_string()))?;
            conv.set_admin(user, is_admin)?;
            conv.to_record()
        };
        self.persist_record(&record);
        Ok(())
    }

    /// Pure state lookup (§5: does not suspend). Returns a snapshot clone
    /// since the live `Conversation` lives behind the client's internal lock.
    pub fn get_conversation(&self, id: &ConversationId) -> Option<Conversation> {
        self.conversations.lock().unwrap_or_else(|p| p.into_inner()).get(id).cloned()
    }

    fn topic_for(&self, conv: &Conversation) -> String {
        match conv.conv_type {
            ConversationType::Direct => topic_for_direct(conv.id.as_str()),
            ConversationType::Group => topic_for_group(conv.id.as_str()),
        }
    }

    async fn subscribe_conversation(self: &Arc<Self>, id: &ConversationId) -> Result<()> {
        let topic = {
            let convs = self.conversations.lock().unwrap_or_else(|p| p.into_inner());
            let conv = convs.get(id).ok_or_else(|| ChatError::ConversationNotFound(id.to_string()))?;
            self.topic_for(conv)
        };

        let mut subs = self.subscriptions.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(entry) = subs.get_mut(id) {
            entry.refcount += 1;
            return Ok(());
        }
        drop(subs);

        let client = Arc::clone(self);
        let token = self.transport.subscribe(&topic, Arc::new(move |data| client.on_envelope_bytes(&data))).await?;
        self.subscriptions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id.clone(), SubscriptionEntry { token, refcount: 1 });
        Ok(())
    }

    /// Drops the caller's reference to the conversation's subscription;
    /// unsubscribes from the transport once the refcount reaches zero.
    pub async fn leave_conversation(&self, id: &ConversationId) -> Result<()> {
        let token = {
            let mut subs = self.subscriptions.lock().unwrap_or_else(|p| p.into_inner());
            let Some(entry) = subs.get_mut(id) else { return Ok(()) };
            entry.refcount = entry.refcount.saturating_sub(1);
            if entry.refcount > 0 {
                return Ok(());
            }
            subs.remove(id).map(|e| e.token)
        };
        if let Some(token) = token {
            self.transport.unsubscribe(token).await?;
        }
        Ok(())
    }

    // ----------------------------------------------------------------- send ----

    /// 8-step send pipeline: look up conversation, build `ChatMessage`,
    /// serialize, sign the plaintext bytes, AEAD-encrypt with the
    /// conversation's session key, wrap in `EncryptedEnvelope`, serialize
    /// again, reliable-publish to the conversation's topic.
    pub async fn send_text(&self, conversation_id: &ConversationId, content: &str) -> Result<MessageId> {
        let payload = TextPayload { content: content.to_string() }.encode();
        self.send_raw(conversation_id, crate::envelope::MessageType::Text, payload).await
    }

    /// Publishing a revoke always succeeds locally, even for a target this
    /// client has no permission to revoke: the revoke-permission oracle is
    /// evaluated by every *receiving* client against its own view of
    /// `original_sender_id`, not by the sender. A denied revoke is simply
    /// ignored wherever it arrives.
    pub async fn send_revoke(&self, conversation_id: &ConversationId, target: &MessageId, reason: &str) -> Result<()> {
        let payload = RevokePayload { target_message_id: target.to_string(), reason: reason.to_string() }.encode();
        self.send_raw(conversation_id, crate::envelope::MessageType::Revoke, payload).await?;
        Ok(())
    }

    async fn send_raw(&self, conversation_id: &ConversationId, msg_type: crate::envelope::MessageType, payload: Vec<u8>) -> Result<MessageId> {
        let (topic, session_key, conv_type) = {
            let convs = self.conversations.lock().unwrap_or_else(|p| p.into_inner());
            let conv = convs.get(conversation_id).ok_or_else(|| ChatError::ConversationNotFound(conversation_id.to_string()))?;
            (self.topic_for(conv), conv.session_key, conv.conv_type)
        };

        let timestamp = now_ms();
        let message_id = new_message_id(timestamp, self.identity.user_id());
        self.publish_signed(&topic, conv_type, conversation_id, &session_key, msg_type, timestamp, &message_id, payload.clone()).await?;

        if matches!(msg_type, crate::envelope::MessageType::Text) {
            if let Ok(text) = TextPayload::decode(&payload) {
                let stored = StoredMessage {
                    conversation_id: conversation_id.clone(),
                    sender_id: self.identity.user_id().clone(),
                    content: text.content,
                    timestamp,
                    verified: true,
                    status: MessageStatus::Sent,
                };
                self.persist_message(conversation_id, &message_id, &stored);
                self.messages.lock().unwrap_or_else(|p| p.into_inner()).insert(message_id.clone(), stored);
            }
        }

        Ok(message_id)
    }

    /// Builds, signs, encrypts, and publishes one `ChatMessage`/
    /// `EncryptedEnvelope` pair under an explicit topic and session key,
    /// rather than the one the conversation currently holds — needed by
    /// `rotate_and_announce_group_key`, which must keep announcing under
    /// the *old* key to members who haven't applied the rotation yet.
    #[allow(clippy::too_many_arguments)]
    async fn publish_signed(
        &self,
        topic: &str,
        conv_type: ConversationType,
        conversation_id: &ConversationId,
        session_key: &[u8; 32],
        msg_type: crate::envelope::MessageType,
        timestamp: u64,
        message_id: &MessageId,
        payload: Vec<u8>,
    ) -> Result<()> {
        let chat_message = ChatMessage {
            message_id: message_id.to_string(),
            sender_id: self.identity.user_id().to_string(),
            conversation_id: conversation_id.to_string(),
            conv_type: match conv_type {
                ConversationType::Direct => crate::envelope::ConversationType::Direct,
                ConversationType::Group => crate::envelope::ConversationType::Group,
            },
            msg_type,
            timestamp,
            payload: payload.clone(),
            version: 1,
        };

        let preimage = crate::envelope::signature_preimage(
            &chat_message.message_id,
            &chat_message.sender_id,
            &chat_message.conversation_id,
            timestamp,
            msg_type,
            &payload,
        );
        let signature = self.identity.sign(&preimage);
        let plaintext = chat_message.encode();
        let (ciphertext, nonce) = crate::crypto::aead_encrypt(session_key, &plaintext)?;

        let envelope = EncryptedEnvelope {
            encrypted_payload: ciphertext,
            nonce: nonce.to_vec(),
            signature: signature.to_vec(),
            sender_id: self.identity.user_id().to_string(),
            timestamp,
            version: 1,
        };

        reliable_publish(&*self.transport, topic, &envelope.encode(), &self.config).await
    }

    /// Publishes a `GroupJoin` control message over the conversation's own
    /// topic, so every member currently subscribed learns of the new
    /// member without polling. Pair with `add_member` (or rely on the
    /// receiving end's `dispatch_control`, which applies the roster change
    /// itself) — this call alone only announces.
    pub async fn announce_group_join(&self, conversation_id: &ConversationId) -> Result<()> {
        let control = ControlPayload::GroupJoin {
            conversation_id: conversation_id.to_string(),
            user_id: self.identity.user_id().to_string(),
        };
        let payload = serde_json::to_vec(&control)?;
        self.send_raw(conversation_id, crate::envelope::MessageType::GroupJoin, payload).await?;
        Ok(())
    }

    /// Publishes a `GroupLeave` control message over the conversation's own
    /// topic, announcing this client's departure to the remaining members.
    pub async fn announce_group_leave(&self, conversation_id: &ConversationId) -> Result<()> {
        let control = ControlPayload::GroupLeave {
            conversation_id: conversation_id.to_string(),
            user_id: self.identity.user_id().to_string(),
        };
        let payload = serde_json::to_vec(&control)?;
        self.send_raw(conversation_id, crate::envelope::MessageType::GroupLeave, payload).await?;
        Ok(())
    }

    /// Rotates a group's session key and announces the new key to every
    /// current member (`Conversation::rotate_group_key_and_reinvite`),
    /// requiring the caller to supply each member's long-term public key
    /// (already known via invites/contacts) so the new key can be
    /// ECIES-wrapped per recipient. The rotation is persisted locally
    /// before any announcement goes out, so a crash mid-broadcast never
    /// leaves the rotation unpersisted. Each `GroupKeyUpdate` is published
    /// under the *old* session key — the members receiving it haven't
    /// applied the rotation yet, so that's the only key they can still
    /// decrypt with.
    pub async fn rotate_and_announce_group_key(
        &self,
        conversation_id: &ConversationId,
        member_pks: &HashMap<UserId, PublicKey>,
    ) -> Result<()> {
        let (topic, conv_type, old_session_key, invites, new_version, record) = {
            let mut convs = self.conversations.lock().unwrap_or_else(|p| p.into_inner());
            let conv = convs.get_mut(conversation_id).ok_or_else(|| ChatError::ConversationNotFound(conversation_id.to_string()))?;
            let old_session_key = conv.session_key;
            let topic = self.topic_for(conv);
            let conv_type = conv.conv_type;
            let invites = conv.rotate_group_key_and_reinvite(member_pks)?;
            (topic, conv_type, old_session_key, invites, conv.key_version, conv.to_record())
        };
        self.persist_record(&record);

        for (member, invite) in invites {
            if member == *self.identity.user_id() {
                continue;
            }
            let control = ControlPayload::GroupKeyUpdate {
                conversation_id: conversation_id.to_string(),
                key_version: new_version,
                encrypted_key: invite.encrypted_group_key,
            };
            let payload = serde_json::to_vec(&control)?;
            let timestamp = now_ms();
            let message_id = new_message_id(timestamp, self.identity.user_id());
            self.publish_signed(
                &topic,
                conv_type,
                conversation_id,
                &old_session_key,
                crate::envelope::MessageType::GroupKeyUpdate,
                timestamp,
                &message_id,
                payload,
            )
            .await?;
        }
        Ok(())
    }

    // -------------------------------------------------------------- receive ----

    fn on_envelope_bytes(self: &Arc<Self>, data: &[u8]) {
        if let Err(e) = self.handle_envelope_bytes(data) {
            log::warn!("dropping inbound message: {e}");
        }
    }

    /// Decrypt -> decode -> dedupe -> resolve signer -> verify -> dispatch.
    /// Decryption/decode/dedupe failures cause a silent drop (logged), never
    /// a propagated error — a malformed message from the network must never
    /// disrupt the receiver. An unresolved signer or a failed signature check
    /// is not a drop: per §6/§4.7 the message is still dispatched, carrying
    /// `verified=false`, so the caller decides what to do with it (a REVOKE
    /// is the one type discarded outright on `verified=false`, inside
    /// `dispatch` itself).
    fn handle_envelope_bytes(self: &Arc<Self>, data: &[u8]) -> Result<()> {
        let envelope = EncryptedEnvelope::decode(data)?;
        let sender_id = UserId::parse(envelope.sender_id.clone())?;

        // The pub/sub overlay echoes a publisher's own messages back to it;
        // the sender already recorded its own copy in `send_raw`.
        if sender_id == *self.identity.user_id() {
            return Ok(());
        }

        // The session key lives on the conversation; the envelope alone
        // doesn't carry conversation_id, so every subscribed conversation's
        // key is tried until one decrypts successfully (cheap: bounded by
        // the number of conversations this client is a member of).
        let candidates: Vec<(ConversationId, [u8; 32])> = {
            let convs = self.conversations.lock().unwrap_or_else(|p| p.into_inner());
            convs.iter().map(|(id, c)| (id.clone(), c.session_key)).collect()
        };

        let nonce: [u8; 12] = envelope
            .nonce
            .as_slice()
            .try_into()
            .map_err(|_| ChatError::DecodeWire("nonce must be 12 bytes".into()))?;

        let mut decrypted = None;
        for (conv_id, key) in candidates {
            if let Ok(plaintext) = crate::crypto::aead_decrypt(&key, &envelope.encrypted_payload, &nonce) {
                decrypted = Some((conv_id, plaintext));
                break;
            }
        }
        let Some((conversation_id, plaintext)) = decrypted else {
            return Err(ChatError::AeadAuth);
        };

        let chat_message = ChatMessage::decode(&plaintext)?;
        let message_id = MessageId::parse(chat_message.message_id.clone())?;

        let is_duplicate = self.dedupe.lock().unwrap_or_else(|p| p.into_inner()).check_and_add(message_id.as_str());
        if is_duplicate {
            return Ok(());
        }

        // An unresolved signer or a bad signature does not drop the
        // message (§6: "reported to handlers as verified=false ... never
        // silently treated as valid"; §4.7 step 4-5) — it is dispatched
        // with `verified=false` and the per-type handler decides.
        let verified = match self.resolver.get_public_key(&sender_id) {
            Some(signer_pk) => {
                let preimage = crate::envelope::signature_preimage(
                    &chat_message.message_id,
                    &chat_message.sender_id,
                    &chat_message.conversation_id,
                    chat_message.timestamp,
                    chat_message.msg_type,
                    &chat_message.payload,
                );
                crate::identity::Identity::verify(&preimage, &envelope.signature, &signer_pk)
            }
            None => {
                log::warn!("no known public key for sender {sender_id}, delivering unverified");
                false
            }
        };

        self.dispatch(conversation_id, message_id, sender_id, chat_message, verified)
    }

    fn dispatch(
        self: &Arc<Self>,
        conversation_id: ConversationId,
        message_id: MessageId,
        sender_id: UserId,
        msg: ChatMessage,
        verified: bool,
    ) -> Result<()> {
        use crate::envelope::MessageType;

        match msg.msg_type {
            MessageType::Text => {
                let text = TextPayload::decode(&msg.payload)?;
                let revoked_on_arrival = {
                    let mut pending = self.pending_revokes.lock().unwrap_or_else(|p| p.into_inner());
                    pending.remove(&message_id)
                };

                let mut tombstoned = false;
                if let Some((revoker, _reason)) = revoked_on_arrival {
                    let convs = self.conversations.lock().unwrap_or_else(|p| p.into_inner());
                    if let Some(conv) = convs.get(&conversation_id) {
                        tombstoned = conv.can_revoke(&revoker, &sender_id);
                    }
                }

                let stored = StoredMessage {
                    conversation_id: conversation_id.clone(),
                    sender_id: sender_id.clone(),
                    content: text.content.clone(),
                    timestamp: msg.timestamp,
                    verified,
                    status: if tombstoned { MessageStatus::Revoked } else { MessageStatus::Sent },
                };
                self.persist_message(&conversation_id, &message_id, &stored);
                self.messages.lock().unwrap_or_else(|p| p.into_inner()).insert(message_id.clone(), stored);

                if !tombstoned {
                    self.emit(IncomingEvent::Text {
                        conversation_id,
                        message_id,
                        sender_id,
                        content: text.content,
                        timestamp: msg.timestamp,
                        verified,
                    });
                } else {
                    self.emit(IncomingEvent::Revoked { conversation_id, message_id });
                }
                Ok(())
            }
            MessageType::Revoke => {
                // §7: ErrSignatureInvalid's disposition for revokes is
                // outright discard, unlike TEXT which is still delivered
                // unverified.
                if !verified {
                    return Ok(());
                }

                let revoke = RevokePayload::decode(&msg.payload)?;
                let target = MessageId::parse(revoke.target_message_id)?;

                let original_sender = {
                    let messages = self.messages.lock().unwrap_or_else(|p| p.into_inner());
                    messages.get(&target).map(|m| m.sender_id.clone())
                };

                match original_sender {
                    Some(original_sender) => {
                        let allowed = {
                            let convs = self.conversations.lock().unwrap_or_else(|p| p.into_inner());
                            convs.get(&conversation_id).map(|c| c.can_revoke(&sender_id, &original_sender)).unwrap_or(false)
                        };
                        if allowed {
                            if let Some(stored) = self.messages.lock().unwrap_or_else(|p| p.into_inner()).get_mut(&target) {
                                stored.status = MessageStatus::Revoked;
                            }
                            self.persist_revoked(&conversation_id, &target, &sender_id, &revoke.reason);
                            self.emit(IncomingEvent::Revoked { conversation_id, message_id: target });
                        }
                    }
                    None => {
                        // Target hasn't arrived yet: stage the revoke and
                        // resolve it when the text message itself is dispatched.
                        self.pending_revokes
                            .lock()
                            .unwrap_or_else(|p| p.into_inner())
                            .insert(target, (sender_id, revoke.reason));
                    }
                }
                Ok(())
            }
            MessageType::KeyExchange
            | MessageType::GroupInvite
            | MessageType::GroupJoin
            | MessageType::GroupLeave
            | MessageType::GroupKeyUpdate => {
                // Membership/key-rotation control messages mutate local
                // state (roster, session key); unlike TEXT there is no
                // "deliver it anyway and let the caller judge" UI surface
                // for these, so an unresolved/invalid signer is discarded
                // outright rather than applied.
                if !verified {
                    return Ok(());
                }
                self.dispatch_control(conversation_id, sender_id, &msg.payload)
            }
        }
    }

    /// Receive-side handling for the group-lifecycle control types.
    /// `GroupInvite` has no producer in this crate: per §6/§4.4 an invite
    /// is handed to the invitee out-of-band (the application decides the
    /// channel), so this arm only exists for an application that chooses to
    /// relay an invite over the system topic itself. `KeyExchange` has no
    /// defined operation anywhere in this crate's contract — direct-session
    /// keys are derived from ECDH, not negotiated over the wire — so it is
    /// parsed but otherwise a no-op. `GroupJoin`/`GroupLeave`/
    /// `GroupKeyUpdate` are produced by `announce_group_join`,
    /// `announce_group_leave`, and `rotate_and_announce_group_key` below.
    fn dispatch_control(self: &Arc<Self>, conversation_id: ConversationId, _sender_id: UserId, payload: &[u8]) -> Result<()> {
        let control: ControlPayload = serde_json::from_slice(payload)?;
        match control {
            ControlPayload::KeyExchange { .. } => Ok(()),
            ControlPayload::GroupInvite { invite } => {
                self.emit(IncomingEvent::GroupInvite { invite });
                Ok(())
            }
            ControlPayload::GroupJoin { conversation_id: conv_id, user_id } => {
                let user_id = UserId::parse(user_id)?;
                let conv_id = ConversationId::parse(conv_id)?;
                let record = {
                    let mut convs = self.conversations.lock().unwrap_or_else(|p| p.into_inner());
                    convs.get_mut(&conv_id).map(|conv| {
                        conv.add_member(user_id.clone());
                        conv.to_record()
                    })
                };
                if let Some(record) = record {
                    self.persist_record(&record);
                }
                self.emit(IncomingEvent::GroupJoin { conversation_id: conv_id, user_id });
                Ok(())
            }
            ControlPayload::GroupLeave { conversation_id: conv_id, user_id } => {
                let user_id = UserId::parse(user_id)?;
                let conv_id = ConversationId::parse(conv_id)?;
                let record = {
                    let mut convs = self.conversations.lock().unwrap_or_else(|p| p.into_inner());
                    convs.get_mut(&conv_id).map(|conv| {
                        conv.remove_member(&user_id);
                        conv.to_record()
                    })
                };
                if let Some(record) = record {
                    self.persist_record(&record);
                }
                self.emit(IncomingEvent::GroupLeave { conversation_id: conv_id, user_id });
                Ok(())
            }
            ControlPayload::GroupKeyUpdate { conversation_id: conv_id, key_version, encrypted_key } => {
                let conv_id = ConversationId::parse(conv_id)?;
                let blob_bytes = hex::decode(&encrypted_key)?;
                let blob = crate::crypto::EciesBlob::from_bytes(&blob_bytes)?;
                let key_bytes = crate::crypto::ecies_decrypt(&self.identity.secret_key_for_ecies(), &blob)?;
                let new_key: [u8; 32] = key_bytes.try_into().map_err(|_| ChatError::DecodeWire("group key must be 32 bytes".into()))?;

                let record = {
                    let mut convs = self.conversations.lock().unwrap_or_else(|p| p.into_inner());
                    match convs.get_mut(&conv_id) {
                        Some(conv) => {
                            conv.update_session_key(new_key, key_version)?;
                            Some(conv.to_record())
                        }
                        None => None,
                    }
                };
                if let Some(record) = record {
                    self.persist_record(&record);
                }
                let _ = &conversation_id;
                self.emit(IncomingEvent::GroupKeyUpdate { conversation_id: conv_id, key_version });
                Ok(())
            }
        }
    }

    fn emit(&self, event: IncomingEvent) {
        if let Some(handler) = self.handler.lock().unwrap_or_else(|p| p.into_inner()).as_ref() {
            handler(event);
        }
    }

    // ---------------------------------------------------------------- history ----

    /// Two-pass reconciliation: first pass decrypts every history entry and
    /// separates text messages from revoke requests; second pass applies
    /// each revoke against the now-fully-known sender map before emitting
    /// events in timestamp order, with tombstoned messages surfaced as
    /// `Revoked` rather than `Text`. This avoids the live-path's
    /// tentative-staging dance, since history is delivered as a single batch
    /// rather than incrementally.
    pub async fn fetch_history(&self, conversation_id: &ConversationId, since_ms: u64) -> Result<Vec<IncomingEvent>> {
        let (topic, session_key) = {
            let convs = self.conversations.lock().unwrap_or_else(|p| p.into_inner());
            let conv = convs.get(conversation_id).ok_or_else(|| ChatError::ConversationNotFound(conversation_id.to_string()))?;
            (self.topic_for(conv), conv.session_key)
        };

        let page: Vec<HistoricalMessage> = self
            .transport
            .query_history(&topic, since_ms, self.config.default_page_size)
            .await?;

        let mut texts: HashMap<MessageId, (UserId, String, u64)> = HashMap::new();
        let mut revokes: Vec<(UserId, MessageId)> = Vec::new();
        let mut order: Vec<MessageId> = Vec::new();

        for entry in page {
            let Ok(envelope) = EncryptedEnvelope::decode(&entry.payload) else { continue };
            let nonce: Result<[u8; 12]> = envelope.nonce.as_slice().try_into().map_err(|_| ChatError::DecodeWire("bad nonce".into()));
            let Ok(nonce) = nonce else { continue };
            let Ok(plaintext) = crate::crypto::aead_decrypt(&session_key, &envelope.encrypted_payload, &nonce) else { continue };
            let Ok(chat_message) = ChatMessage::decode(&plaintext) else { continue };
            let Ok(sender_id) = UserId::parse(envelope.sender_id.clone()) else { continue };

            let Some(signer_pk) = self.resolver.get_public_key(&sender_id) else { continue };
            let preimage = crate::envelope::signature_preimage(
                &chat_message.message_id,
                &chat_message.sender_id,
                &chat_message.conversation_id,
                chat_message.timestamp,
                chat_message.msg_type,
                &chat_message.payload,
            );
            if !crate::identity::Identity::verify(&preimage, &envelope.signature, &signer_pk) {
                continue;
            }

            match chat_message.msg_type {
                crate::envelope::MessageType::Text => {
                    let Ok(text) = TextPayload::decode(&chat_message.payload) else { continue };
                    let Ok(message_id) = MessageId::parse(chat_message.message_id.clone()) else { continue };
                    order.push(message_id.clone());
                    texts.insert(message_id, (sender_id, text.content, chat_message.timestamp));
                }
                crate::envelope::MessageType::Revoke => {
                    let Ok(revoke) = RevokePayload::decode(&chat_message.payload) else { continue };
                    let Ok(target) = MessageId::parse(revoke.target_message_id) else { continue };
                    revokes.push((sender_id, target));
                }
                _ => {}
            }
        }

        let mut tombstoned = std::collections::HashSet::new();
        {
            let convs = self.conversations.lock().unwrap_or_else(|p| p.into_inner());
            let Some(conv) = convs.get(conversation_id) else { return Err(ChatError::ConversationNotFound(conversation_id.to_string())) };
            for (revoker, target) in revokes {
                if let Some((original_sender, _, _)) = texts.get(&target) {
                    if conv.can_revoke(&revoker, original_sender) {
                        tombstoned.insert(target);
                    }
                }
            }
        }
        // A tombstone persisted from a prior session or a prior live delivery
        // also marks a message revoked here, independent of whether this
        // particular history page carries a REVOKE for it.
        for message_id in texts.keys() {
            if self.is_revoked_in_store(message_id) {
                tombstoned.insert(message_id.clone());
            }
        }

        // Pass 2 emits in sender-assigned timestamp order (§4.7), not
        // transport arrival order, which may disagree with it (e.g. a
        // REVOKE for M1 queued ahead of M1 itself).
        order.sort_by_key(|id| texts.get(id).map(|(_, _, ts)| *ts).unwrap_or(0));

        let mut events = Vec::new();
        for message_id in order {
            if tombstoned.contains(&message_id) {
                texts.remove(&message_id);
                events.push(IncomingEvent::Revoked { conversation_id: conversation_id.clone(), message_id });
                continue;
            }
            if let Some((sender_id, content, timestamp)) = texts.remove(&message_id) {
                events.push(IncomingEvent::Text {
                    conversation_id: conversation_id.clone(),
                    message_id,
                    sender_id,
                    content,
                    timestamp,
                    // Only signatures that verified against a resolved
                    // signer reach this far — unverifiable history entries
                    // were skipped above (`continue`), not just excluded
                    // from `verified`.
                    verified: true,
                });
            }
        }
        Ok(events)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }
}
