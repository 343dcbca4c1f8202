// src/identity.rs
// Long-term identity key pair (C2). The user identifier is a pure function
// of the public key; loading an encrypted identity re-derives both the
// public key and the identifier from the decrypted private key and refuses
// to load on any mismatch (§4.2).

use argon2::{Argon2, Params, Version};
use rand::RngCore;
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypto::{self, AEAD_KEY_LEN, NONCE_LEN};
use crate::error::{ChatError, Result};
use crate::ids::UserId;

/// Long-term key pair for one user. The private scalar is held in a
/// zeroizing buffer and wiped when the identity is dropped (§5).
pub struct Identity {
    secret_key: Zeroizing<[u8; 32]>,
    public_key: PublicKey,
    user_id: UserId,
}

/// JSON shape of an exported identity (§6). `kdf`/`salt` are present only
/// on `version: 2` exports; `version: 1` exports remain importable forever.
#[derive(Serialize, Deserialize)]
struct IdentityExport {
    version: u32,
    #[serde(rename = "userId")]
    user_id: String,
    #[serde(rename = "publicKey")]
    public_key: String,
    #[serde(rename = "encryptedPrivateKey")]
    encrypted_private_key: String,
    nonce: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    kdf: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    salt: Option<String>,
}

fn user_id_from_public_key(pk: &PublicKey) -> UserId {
    let hash = crypto::sha256(&pk.serialize());
    UserId::from_validated(hex::encode(&hash[..20]))
}

impl Identity {
    /// Generate a fresh random key pair.
    pub fn create() -> Self {
        let secp = Secp256k1::new();
        let (sk, pk) = secp.generate_keypair(&mut rand::thread_rng());
        let user_id = user_id_from_public_key(&pk);
        Identity { secret_key: Zeroizing::new(sk.secret_bytes()), public_key: pk, user_id }
    }

    /// Build an identity from an existing private scalar.
    pub fn from_private_key(sk_bytes: &[u8; 32]) -> Result<Self> {
        let sk = SecretKey::from_slice(sk_bytes).map_err(|e| ChatError::InvalidKey(e.to_string()))?;
        let pk = PublicKey::from_secret_key(&Secp256k1::new(), &sk);
        let user_id = user_id_from_public_key(&pk);
        Ok(Identity { secret_key: Zeroizing::new(sk.secret_bytes()), public_key: pk, user_id })
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    fn secret_key(&self) -> SecretKey {
        // Constructed fresh from validated bytes stored at construction time;
        // cannot fail.
        SecretKey::from_slice(&*self.secret_key).expect("identity holds a valid secret key")
    }

    /// Exposes the raw secret key to crate-internal callers that need it for
    /// primitives `Identity` doesn't itself wrap (e.g. ECIES decryption of an
    /// inbound group invite).
    pub(crate) fn secret_key_for_ecies(&self) -> SecretKey {
        self.secret_key()
    }

    /// Compact 64-byte ECDSA signature over SHA-256(data).
    pub fn sign(&self, data: &[u8]) -> [u8; 64] {
        crypto::sign(&self.secret_key(), data)
    }

    /// Verify a signature from an arbitrary (possibly unrelated) public key.
    /// Never raises — malformed input simply yields `false`.
    pub fn verify(data: &[u8], sig: &[u8], pk: &PublicKey) -> bool {
        crypto::verify(pk, data, sig)
    }

    /// ECDH x-coordinate shared with `peer_pk`.
    pub fn derive_shared(&self, peer_pk: &PublicKey) -> [u8; 32] {
        crypto::ecdh_x_coordinate(&self.secret_key(), peer_pk)
    }

    /// Export this identity as password-encrypted JSON (`version: 1`,
    /// `SHA-256(password)` as the wrapping key — a known weakness, see
    /// `export_v2` for the Argon2id-backed upgrade).
    pub fn export(&self, password: &str) -> Result<String> {
        let wrap_key = crypto::sha256(password.as_bytes());
        let (ciphertext, nonce) = crypto::aead_encrypt(&wrap_key, &*self.secret_key)?;

        let doc = IdentityExport {
            version: 1,
            user_id: self.user_id.as_str().to_string(),
            public_key: hex::encode(self.public_key.serialize()),
            encrypted_private_key: hex::encode(ciphertext),
            nonce: hex::encode(nonce),
            kdf: None,
            salt: None,
        };
        Ok(serde_json::to_string(&doc)?)
    }

    /// Export using Argon2id instead of plain SHA-256 (the upgrade path
    /// noted as an Open Question; `version: 1` remains importable).
    pub fn export_v2(&self, password: &str) -> Result<String> {
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        let wrap_key = argon2id_derive(password.as_bytes(), &salt)?;
        let (ciphertext, nonce) = crypto::aead_encrypt(&wrap_key, &*self.secret_key)?;

        let doc = IdentityExport {
            version: 2,
            user_id: self.user_id.as_str().to_string(),
            public_key: hex::encode(self.public_key.serialize()),
            encrypted_private_key: hex::encode(ciphertext),
            nonce: hex::encode(nonce),
            kdf: Some("argon2id".to_string()),
            salt: Some(hex::encode(salt)),
        };
        Ok(serde_json::to_string(&doc)?)
    }

    /// Import a password-encrypted identity. Dispatches on `version`; after
    /// decrypting the private key, re-derives the public key and user
    /// identifier and rejects with `ChatError::IdentityMismatch` if either
    /// disagrees with the stored fields.
    pub fn import(json: &str, password: &str) -> Result<Self> {
        let doc: IdentityExport = serde_json::from_str(json)?;

        let wrap_key = match doc.version {
            1 => crypto::sha256(password.as_bytes()),
            2 => {
                let salt_hex = doc.salt.as_deref().ok_or_else(|| {
                    ChatError::DecodeWire("version 2 export missing salt".into())
                })?;
                let salt = hex::decode(salt_hex)?;
                let salt: [u8; 16] = salt
                    .try_into()
                    .map_err(|_| ChatError::DecodeWire("salt must be 16 bytes".into()))?;
                argon2id_derive(password.as_bytes(), &salt)?
            }
            v => return Err(ChatError::DecodeWire(format!("unsupported export version {v}"))),
        };

        let ciphertext = hex::decode(&doc.encrypted_private_key)?;
        let nonce_bytes = hex::decode(&doc.nonce)?;
        let nonce: [u8; NONCE_LEN] = nonce_bytes
            .try_into()
            .map_err(|_| ChatError::DecodeWire("nonce must be 12 bytes".into()))?;

        let plaintext = crypto::aead_decrypt(&wrap_key, &ciphertext, &nonce)?;
        let sk_bytes: [u8; 32] = plaintext
            .as_slice()
            .try_into()
            .map_err(|_| ChatError::DecodeWire("decrypted private key must be 32 bytes".into()))?;

        let identity = Identity::from_private_key(&sk_bytes)?;

        let expected_pk = hex::encode(identity.public_key.serialize());
        if expected_pk != doc.public_key || identity.user_id.as_str() != doc.user_id {
            return Err(ChatError::IdentityMismatch);
        }

        Ok(identity)
    }
}

fn argon2id_derive(password: &[u8], salt: &[u8; 16]) -> Result<[u8; AEAD_KEY_LEN]> {
    let params = Params::new(64 * 1024, 3, 1, Some(AEAD_KEY_LEN))
        .expect("static Argon2 params are always valid");
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, params);
    let mut out = [0u8; AEAD_KEY_LEN];
    argon2
        .hash_password_into(password, salt, &mut out)
        .map_err(|e| ChatError::KeyDerivation(e.to_string()))?;
    Ok(out)
}
