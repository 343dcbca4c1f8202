// src/crypto.rs
// Cryptographic primitives (C1): AEAD, ECDH, HKDF, ECDSA, ECIES.
// Stateless — every function takes its key material as an argument and
// returns owned buffers. No nonce is ever reused for a given key: callers
// always draw a fresh nonce from the CSPRNG per call.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use secp256k1::ecdh as secp_ecdh;
use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};

use crate::error::{ChatError, Result};

pub const NONCE_LEN: usize = 12;
pub const AEAD_KEY_LEN: usize = 32;
pub const COMPRESSED_PUBKEY_LEN: usize = 33;
pub const SIGNATURE_LEN: usize = 64;

/// SHA-256 of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

// ---------------------------------------------------------------- AEAD ----

/// AES-256-GCM encrypt. Returns `(ciphertext_with_tag, nonce)`. The nonce is
/// drawn fresh from the CSPRNG on every call.
pub fn aead_encrypt(key: &[u8; AEAD_KEY_LEN], plaintext: &[u8]) -> Result<(Vec<u8>, [u8; NONCE_LEN])> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| ChatError::InvalidKey(e.to_string()))?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| ChatError::AeadAuth)?;

    Ok((ciphertext, nonce_bytes))
}

/// AES-256-GCM decrypt. Fails with `ChatError::AeadAuth` on tag mismatch.
pub fn aead_decrypt(
    key: &[u8; AEAD_KEY_LEN],
    ciphertext: &[u8],
    nonce: &[u8; NONCE_LEN],
) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| ChatError::InvalidKey(e.to_string()))?;
    let nonce = Nonce::from_slice(nonce);

    cipher.decrypt(nonce, ciphertext).map_err(|_| ChatError::AeadAuth)
}

// ---------------------------------------------------------------- ECDH ----

/// ECDH over secp256k1. Returns the 32-byte x-coordinate of the shared
/// point `sk * pk`, un-hashed — callers run this through HKDF themselves
/// (the contract is explicit that it is the raw x-coordinate, not a
/// pre-hashed shared secret).
pub fn ecdh_x_coordinate(sk: &SecretKey, pk: &PublicKey) -> [u8; 32] {
    let point = secp_ecdh::shared_secret_point(pk, sk);
    let mut x = [0u8; 32];
    x.copy_from_slice(&point[..32]);
    x
}

// ---------------------------------------------------------------- HKDF ----

/// HKDF-SHA256 extract-then-expand. To derive multiple sub-keys, call this
/// once with an `out` long enough to hold all of them and slice the result
/// — never call `expand` more than once per derivation.
pub fn hkdf_expand(ikm: &[u8], salt: &[u8], info: &[u8], out: &mut [u8]) -> Result<()> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    hk.expand(info, out)
        .map_err(|e| ChatError::KeyDerivation(e.to_string()))
}

/// Convenience wrapper returning a fixed 32-byte key.
pub fn hkdf_expand_32(ikm: &[u8], salt: &[u8], info: &[u8]) -> Result<[u8; 32]> {
    let mut out = [0u8; 32];
    hkdf_expand(ikm, salt, info, &mut out)?;
    Ok(out)
}

// --------------------------------------------------------------- ECDSA ----

/// Sign SHA-256(data) with a compact 64-byte (r||s) ECDSA signature.
pub fn sign(sk: &SecretKey, data: &[u8]) -> [u8; SIGNATURE_LEN] {
    let digest = sha256(data);
    // sha256 output is always a valid 32-byte message digest.
    let msg = Message::from_digest(digest);
    let secp = Secp256k1::signing_only();
    let sig = secp.sign_ecdsa(&msg, sk);
    sig.serialize_compact()
}

/// Verify a compact 64-byte signature over SHA-256(data). Never raises —
/// any malformed input (wrong-length signature, unparsable public key)
/// simply yields `false`.
pub fn verify(pk: &PublicKey, data: &[u8], sig: &[u8]) -> bool {
    let Ok(signature) = Signature::from_compact(sig) else { return false };
    let digest = sha256(data);
    let msg = Message::from_digest(digest);
    let secp = Secp256k1::verification_only();
    secp.verify_ecdsa(&msg, &signature, pk).is_ok()
}

// --------------------------------------------------------------- ECIES ----

pub struct EciesBlob {
    pub ephemeral_pk: [u8; COMPRESSED_PUBKEY_LEN],
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

impl EciesBlob {
    /// Fixed-width wire serialization: `E || nonce || ciphertext`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(COMPRESSED_PUBKEY_LEN + NONCE_LEN + self.ciphertext.len());
        out.extend_from_slice(&self.ephemeral_pk);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < COMPRESSED_PUBKEY_LEN + NONCE_LEN {
            return Err(ChatError::DecodeWire("ECIES blob too short".into()));
        }
        let mut ephemeral_pk = [0u8; COMPRESSED_PUBKEY_LEN];
        ephemeral_pk.copy_from_slice(&data[..COMPRESSED_PUBKEY_LEN]);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&data[COMPRESSED_PUBKEY_LEN..COMPRESSED_PUBKEY_LEN + NONCE_LEN]);
        let ciphertext = data[COMPRESSED_PUBKEY_LEN + NONCE_LEN..].to_vec();
        Ok(Self { ephemeral_pk, nonce, ciphertext })
    }
}

const ECIES_INFO: &[u8] = b"ecies-encryption-key";

/// ECIES-encrypt `plaintext` to `recipient_pk`: generate an ephemeral key
/// pair, ECDH with the recipient, HKDF-derive an AEAD key salted with the
/// ephemeral public key, and AEAD-encrypt.
pub fn ecies_encrypt(recipient_pk: &PublicKey, plaintext: &[u8]) -> Result<EciesBlob> {
    let secp = Secp256k1::new();
    let (ephemeral_sk, ephemeral_pk) = secp.generate_keypair(&mut rand::thread_rng());

    let shared_x = ecdh_x_coordinate(&ephemeral_sk, recipient_pk);
    let ephemeral_pk_bytes = ephemeral_pk.serialize();
    let key = hkdf_expand_32(&shared_x, &ephemeral_pk_bytes, ECIES_INFO)?;

    let (ciphertext, nonce) = aead_encrypt(&key, plaintext)?;

    Ok(EciesBlob { ephemeral_pk: ephemeral_pk_bytes, nonce, ciphertext })
}

/// Reverse `ecies_encrypt` using the recipient's private key.
pub fn ecies_decrypt(recipient_sk: &SecretKey, blob: &EciesBlob) -> Result<Vec<u8>> {
    let ephemeral_pk = PublicKey::from_slice(&blob.ephemeral_pk)
        .map_err(|e| ChatError::InvalidKey(e.to_string()))?;

    let shared_x = ecdh_x_coordinate(recipient_sk, &ephemeral_pk);
    let key = hkdf_expand_32(&shared_x, &blob.ephemeral_pk, ECIES_INFO)?;

    aead_decrypt(&key, &blob.ciphertext, &blob.nonce)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aead_round_trip() {
        let key = [7u8; AEAD_KEY_LEN];
        let (ct, nonce) = aead_encrypt(&key, b"hello world").unwrap();
        let pt = aead_decrypt(&key, &ct, &nonce).unwrap();
        assert_eq!(pt, b"hello world");
    }

    #[test]
    fn aead_tamper_fails() {
        let key = [7u8; AEAD_KEY_LEN];
        let (mut ct, nonce) = aead_encrypt(&key, b"hello world").unwrap();
        *ct.last_mut().unwrap() ^= 0xFF;
        assert!(aead_decrypt(&key, &ct, &nonce).is_err());
    }

    #[test]
    fn ecdh_is_symmetric() {
        let secp = Secp256k1::new();
        let (sk_a, pk_a) = secp.generate_keypair(&mut rand::thread_rng());
        let (sk_b, pk_b) = secp.generate_keypair(&mut rand::thread_rng());

        let shared_a = ecdh_x_coordinate(&sk_a, &pk_b);
        let shared_b = ecdh_x_coordinate(&sk_b, &pk_a);
        assert_eq!(shared_a, shared_b);
    }

    #[test]
    fn signature_forgery_resistance() {
        let secp = Secp256k1::new();
        let (sk1, _pk1) = secp.generate_keypair(&mut rand::thread_rng());
        let (_sk2, pk2) = secp.generate_keypair(&mut rand::thread_rng());

        let data = b"revoke:message-123";
        let sig = sign(&sk1, data);
        assert!(!verify(&pk2, data, &sig));
    }

    #[test]
    fn verify_never_panics_on_garbage() {
        let secp = Secp256k1::new();
        let (_sk, pk) = secp.generate_keypair(&mut rand::thread_rng());
        assert!(!verify(&pk, b"data", &[0u8; 3]));
        assert!(!verify(&pk, b"data", &[0u8; 64]));
    }

    #[test]
    fn ecies_round_trip() {
        let secp = Secp256k1::new();
        let (sk, pk) = secp.generate_keypair(&mut rand::thread_rng());
        let blob = ecies_encrypt(&pk, b"group session key material").unwrap();
        let wire = blob.to_bytes();
        let parsed = EciesBlob::from_bytes(&wire).unwrap();
        let plaintext = ecies_decrypt(&sk, &parsed).unwrap();
        assert_eq!(plaintext, b"group session key material");
    }
}
