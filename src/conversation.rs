// src/conversation.rs
// Conversation state machine and key management (C4): direct-conversation
// derivation, group creation/join/invite, key rotation, membership/admin
// invariants, and the revoke-permission oracle.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};

use crate::crypto;
use crate::error::{ChatError, Result};
use crate::identity::Identity;
use crate::ids::{ConversationId, UserId};

const DIRECT_SESSION_INFO: &[u8] = b"encrypted-chat-session-key";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationType {
    Direct,
    Group,
}

/// Which rule of `can_revoke` fired. Exposed for observability: a user who
/// is both the original sender and a group admin is recorded as `Sender`,
/// since sender always takes priority over admin status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevokeRule {
    Sender,
    Admin,
    Denied,
}

#[derive(Clone)]
pub struct Conversation {
    pub id: ConversationId,
    pub conv_type: ConversationType,
    pub members: HashSet<UserId>,
    pub admins: HashSet<UserId>,
    pub session_key: [u8; 32],
    pub key_version: u32,
    pub name: String,
    pub created_at: u64,
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch").as_millis() as u64
}

impl Conversation {
    /// Deterministic per-pair derivation: both parties, given only their
    /// own private key and the other's public key, compute byte-identical
    /// `id` and `session_key` (§3, §8 invariant 4).
    pub fn create_direct(me: &Identity, peer_id: &UserId, peer_pk: &PublicKey) -> Self {
        let my_id = me.user_id();
        let (lo, hi) = if my_id.as_str() < peer_id.as_str() {
            (my_id.as_str(), peer_id.as_str())
        } else {
            (peer_id.as_str(), my_id.as_str())
        };
        let preimage = format!("{lo}:{hi}");
        let id_hash = crypto::sha256(preimage.as_bytes());
        let id = ConversationId::from_validated(hex::encode(&id_hash[..16]));

        let shared = me.derive_shared(peer_pk);
        let session_key = crypto::hkdf_expand_32(&shared, id.as_str().as_bytes(), DIRECT_SESSION_INFO)
            .expect("32-byte HKDF expand cannot fail");

        let mut members = HashSet::new();
        members.insert(my_id.clone());
        members.insert(peer_id.clone());

        Conversation {
            id,
            conv_type: ConversationType::Direct,
            members,
            admins: HashSet::new(),
            session_key,
            key_version: 1,
            name: String::new(),
            created_at: now_ms(),
        }
    }

    /// Creator is the sole initial member and sole admin; fresh random
    /// session key; `key_version = 1`.
    pub fn create_group(name: impl Into<String>, creator_id: &UserId) -> Self {
        let mut ts_bytes = [0u8; 8];
        ts_bytes[2..].copy_from_slice(&now_ms().to_be_bytes()[2..]);
        // 12 hex chars = 6 bytes of millisecond timestamp.
        let ts_hex = hex::encode(&ts_bytes[2..]);

        let mut random_suffix = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut random_suffix);
        let id = ConversationId::from_validated(format!("{ts_hex}{}", hex::encode(random_suffix)));

        let mut session_key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut session_key);

        let mut members = HashSet::new();
        members.insert(creator_id.clone());
        let mut admins = HashSet::new();
        admins.insert(creator_id.clone());

        Conversation {
            id,
            conv_type: ConversationType::Group,
            members,
            admins,
            session_key,
            key_version: 1,
            name: name.into(),
            created_at: now_ms(),
        }
    }

    /// Only meaningful for groups; produces an ECIES-wrapped invite for `invitee_pk`.
    pub fn create_invite(&self, invitee_pk: &PublicKey) -> Result<GroupInvite> {
        if self.conv_type != ConversationType::Group {
            return Err(ChatError::PermissionDenied);
        }
        let blob = crypto::ecies_encrypt(invitee_pk, &self.session_key)?;
        Ok(GroupInvite {
            group_id: self.id.clone(),
            group_name: self.name.clone(),
            encrypted_group_key: hex::encode(blob.to_bytes()),
            members: self.members.iter().cloned().collect(),
            admins: self.admins.iter().cloned().collect(),
            key_version: self.key_version,
        })
    }

    /// Only succeeds if ECIES decryption succeeds; appends the joiner to
    /// the returned conversation's member set.
    pub fn join_group(invite: &GroupInvite, my_id: &UserId, me: &Identity) -> Result<Self> {
        let blob_bytes = hex::decode(&invite.encrypted_group_key)?;
        let blob = crypto::EciesBlob::from_bytes(&blob_bytes)?;
        let key_bytes = crypto::ecies_decrypt(&me.secret_key_for_ecies(), &blob)?;
        let session_key: [u8; 32] = key_bytes
            .try_into()
            .map_err(|_| ChatError::DecodeWire("group session key must be 32 bytes".into()))?;

        let mut members: HashSet<UserId> = invite.members.iter().cloned().collect();
        members.insert(my_id.clone());

        Ok(Conversation {
            id: invite.group_id.clone(),
            conv_type: ConversationType::Group,
            members,
            admins: invite.admins.iter().cloned().collect(),
            session_key,
            key_version: invite.key_version,
            name: invite.group_name.clone(),
            created_at: now_ms(),
        })
    }

    /// Idempotent on presence.
    pub fn add_member(&mut self, user: UserId) {
        self.members.insert(user);
    }

    /// Idempotent on presence; removing a member also removes any admin status.
    pub fn remove_member(&mut self, user: &UserId) {
        self.members.remove(user);
        self.admins.remove(user);
    }

    /// Fails with `ErrNotMember` if the target is not a member.
    pub fn set_admin(&mut self, user: &UserId, is_admin: bool) -> Result<()> {
        if !self.members.contains(user) {
            return Err(ChatError::NotMember(user.to_string()));
        }
        if is_admin {
            self.admins.insert(user.clone());
        } else {
            self.admins.remove(user);
        }
        Ok(())
    }

    /// Returns the new 32-byte key and increments `key_version`. Not atomic
    /// across peers: the caller must follow this with per-member ECIES
    /// re-invites (or call `rotate_group_key_and_reinvite` to get both
    /// steps in one call).
    pub fn rotate_group_key(&mut self) -> [u8; 32] {
        let mut new_key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut new_key);
        self.session_key = new_key;
        self.key_version += 1;
        new_key
    }

    /// Convenience combining `rotate_group_key` with `create_invite` for
    /// every current member, per §9's Open Question: an implementation
    /// "may elect to return the new invites directly from
    /// `rotate_group_key`." Rotation itself is still a local-only mutation
    /// — publishing the returned invites remains the caller's job.
    pub fn rotate_group_key_and_reinvite(
        &mut self,
        member_pks: &std::collections::HashMap<UserId, PublicKey>,
    ) -> Result<Vec<(UserId, GroupInvite)>> {
        self.rotate_group_key();
        let mut invites = Vec::with_capacity(self.members.len());
        for member in self.members.iter() {
            let pk = member_pks
                .get(member)
                .ok_or_else(|| ChatError::NotMember(member.to_string()))?;
            invites.push((member.clone(), self.create_invite(pk)?));
        }
        Ok(invites)
    }

    /// Requires `new_version > current`; fails with `ErrStaleKeyVersion` otherwise.
    pub fn update_session_key(&mut self, new_key: [u8; 32], new_version: u32) -> Result<()> {
        if new_version <= self.key_version {
            return Err(ChatError::StaleKeyVersion { current: self.key_version, attempted: new_version });
        }
        self.session_key = new_key;
        self.key_version = new_version;
        Ok(())
    }

    /// The revoke-permission oracle. Rule order matters for observability:
    /// a user who is both sender and admin is recorded as `sender`.
    pub fn revoke_rule(&self, revoker_id: &UserId, original_sender_id: &UserId) -> RevokeRule {
        if revoker_id == original_sender_id {
            return RevokeRule::Sender;
        }
        if self.conv_type == ConversationType::Group && self.admins.contains(revoker_id) {
            return RevokeRule::Admin;
        }
        RevokeRule::Denied
    }

    pub fn can_revoke(&self, revoker_id: &UserId, original_sender_id: &UserId) -> bool {
        !matches!(self.revoke_rule(revoker_id, original_sender_id), RevokeRule::Denied)
    }

    /// Flattens this conversation into its persisted form (§6's
    /// `conversation:<cid>` record) — `session_key` hex-encoded, since the
    /// `Store` contract carries strings only.
    pub fn to_record(&self) -> ConversationRecord {
        ConversationRecord {
            id: self.id.clone(),
            conv_type: self.conv_type,
            members: self.members.iter().cloned().collect(),
            admins: self.admins.iter().cloned().collect(),
            session_key_hex: hex::encode(self.session_key),
            key_version: self.key_version,
            name: self.name.clone(),
            created_at: self.created_at,
        }
    }

    pub fn from_record(record: &ConversationRecord) -> Result<Self> {
        let key_bytes = hex::decode(&record.session_key_hex)?;
        let session_key: [u8; 32] = key_bytes
            .try_into()
            .map_err(|_| ChatError::DecodeWire("persisted session key must be 32 bytes".into()))?;
        Ok(Conversation {
            id: record.id.clone(),
            conv_type: record.conv_type,
            members: record.members.iter().cloned().collect(),
            admins: record.admins.iter().cloned().collect(),
            session_key,
            key_version: record.key_version,
            name: record.name.clone(),
            created_at: record.created_at,
        })
    }
}

/// Persisted shape of a `Conversation` (§6's `conversation:<cid>` key).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub conv_type: ConversationType,
    pub members: Vec<UserId>,
    pub admins: Vec<UserId>,
    pub session_key_hex: String,
    pub key_version: u32,
    pub name: String,
    pub created_at: u64,
}

/// Application-defined, transported out-of-band (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupInvite {
    #[serde(rename = "groupId")]
    pub group_id: ConversationId,
    #[serde(rename = "groupName")]
    pub group_name: String,
    #[serde(rename = "encryptedGroupKey")]
    pub encrypted_group_key: String,
    pub members: Vec<UserId>,
    pub admins: Vec<UserId>,
    #[serde(rename = "keyVersion")]
    pub key_version: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_conversation_converges() {
        let alice = Identity::create();
        let bob = Identity::create();

        let conv_a = Conversation::create_direct(&alice, bob.user_id(), bob.public_key());
        let conv_b = Conversation::create_direct(&bob, alice.user_id(), alice.public_key());

        assert_eq!(conv_a.id, conv_b.id);
        assert_eq!(conv_a.session_key, conv_b.session_key);
    }

    #[test]
    fn direct_can_revoke_only_sender() {
        let alice = Identity::create();
        let bob = Identity::create();
        let conv = Conversation::create_direct(&alice, bob.user_id(), bob.public_key());

        assert!(conv.can_revoke(alice.user_id(), alice.user_id()));
        assert!(!conv.can_revoke(bob.user_id(), alice.user_id()));
    }

    #[test]
    fn group_admin_can_revoke_others_and_sender_rule_wins_when_both() {
        let alice = Identity::create();
        let bob = Identity::create();
        let mut group = Conversation::create_group("Test", alice.user_id());
        group.add_member(bob.user_id().clone());

        assert_eq!(group.revoke_rule(alice.user_id(), bob.user_id()), RevokeRule::Admin);
        assert_eq!(group.revoke_rule(bob.user_id(), bob.user_id()), RevokeRule::Sender);
        assert_eq!(group.revoke_rule(bob.user_id(), alice.user_id()), RevokeRule::Denied);
    }

    #[test]
    fn remove_member_strips_admin() {
        let alice = Identity::create();
        let bob = Identity::create();
        let mut group = Conversation::create_group("Test", alice.user_id());
        group.add_member(bob.user_id().clone());
        group.set_admin(bob.user_id(), true).unwrap();
        assert!(group.admins.contains(bob.user_id()));

        group.remove_member(bob.user_id());
        assert!(!group.members.contains(bob.user_id()));
        assert!(!group.admins.contains(bob.user_id()));
    }

    #[test]
    fn set_admin_on_non_member_fails() {
        let alice = Identity::create();
        let bob = Identity::create();
        let mut group = Conversation::create_group("Test", alice.user_id());
        assert!(matches!(group.set_admin(bob.user_id(), true), Err(ChatError::NotMember(_))));
    }

    #[test]
    fn stale_key_version_rejected() {
        let alice = Identity::create();
        let mut group = Conversation::create_group("Test", alice.user_id());
        let key = [1u8; 32];
        assert!(group.update_session_key(key, 1).is_err());
        assert!(group.update_session_key(key, 2).is_ok());
    }

    #[test]
    fn invite_join_round_trip() {
        let alice = Identity::create();
        let bob = Identity::create();
        let group = Conversation::create_group("Test", alice.user_id());

        let invite = group.create_invite(bob.public_key()).unwrap();
        let joined = Conversation::join_group(&invite, bob.user_id(), &bob).unwrap();

        assert_eq!(joined.session_key, group.session_key);
        assert!(joined.members.contains(bob.user_id()));
        assert!(joined.members.contains(alice.user_id()));
    }

    #[test]
    fn conversation_record_round_trip_preserves_session_key() {
        let alice = Identity::create();
        let group = Conversation::create_group("Test", alice.user_id());

        let record = group.to_record();
        let json = serde_json::to_string(&record).unwrap();
        let parsed: ConversationRecord = serde_json::from_str(&json).unwrap();
        let restored = Conversation::from_record(&parsed).unwrap();

        assert_eq!(restored.id, group.id);
        assert_eq!(restored.session_key, group.session_key);
        assert_eq!(restored.key_version, group.key_version);
        assert_eq!(restored.admins, group.admins);
    }
}
