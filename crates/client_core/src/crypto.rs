use std::{
    fmt,
    sync::{PoisonError, RwLock},
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    ChaCha20Poly1305, Nonce,
};
use shared::{
    domain::{ChannelId, UserId},
    protocol::DmE2eeEnvelope,
};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::{error::CryptoError, DmCipher, KeyVault};

const DM_E2EE_INFO_PREFIX: &[u8] = b"channel-sync/dm-e2ee/v1";
const DM_E2EE_ENVELOPE_VERSION: u8 = 1;
const NONCE_LEN: usize = 12;

/// Local X25519 identity key. Zeroized on drop.
#[derive(Clone)]
pub struct PrivateKey(StaticSecret);

impl PrivateKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = Zeroizing::new(
            STANDARD
                .decode(encoded.trim())
                .map_err(|err| CryptoError::InvalidKey(err.to_string()))?,
        );
        let bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())))?;
        Ok(Self::from_bytes(bytes))
    }

    pub fn generate() -> Self {
        Self(StaticSecret::random_from_rng(OsRng))
    }

    pub fn public_key(&self) -> PeerPublicKey {
        PeerPublicKey(PublicKey::from(&self.0).to_bytes())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerPublicKey(pub [u8; 32]);

impl PeerPublicKey {
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|err| CryptoError::InvalidKey(err.to_string()))?;
        let bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())))?;
        Ok(Self(bytes))
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }
}

/// Static-static X25519 agreement, HKDF-SHA256 and ChaCha20-Poly1305. Both
/// sides of a DM derive the same key; the channel id salts the derivation and
/// authenticates each ciphertext.
#[derive(Debug, Default, Clone, Copy)]
pub struct X25519DmCipher;

impl X25519DmCipher {
    fn channel_cipher(
        channel_id: &ChannelId,
        private_key: &PrivateKey,
        peer_public_key: &PeerPublicKey,
    ) -> Result<ChaCha20Poly1305, CryptoError> {
        let shared = private_key
            .0
            .diffie_hellman(&PublicKey::from(peer_public_key.0));
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidKey(
                "peer public key is a low-order point".into(),
            ));
        }

        let info = build_dm_hkdf_info(&private_key.public_key(), peer_public_key);
        let hk = hkdf::Hkdf::<sha2::Sha256>::new(
            Some(channel_id.as_str().as_bytes()),
            shared.as_bytes(),
        );
        let mut key = Zeroizing::new([0u8; 32]);
        hk.expand(&info, &mut *key)
            .map_err(|_| CryptoError::InvalidKey("hkdf expansion failed".into()))?;
        ChaCha20Poly1305::new_from_slice(&key[..])
            .map_err(|_| CryptoError::InvalidKey("invalid derived key length".into()))
    }
}

impl DmCipher for X25519DmCipher {
    fn encrypt(
        &self,
        channel_id: &ChannelId,
        plaintext: &str,
        private_key: &PrivateKey,
        peer_public_key: &PeerPublicKey,
        _peer_user_id: &UserId,
    ) -> Result<DmE2eeEnvelope, CryptoError> {
        let cipher = Self::channel_cipher(channel_id, private_key, peer_public_key)?;
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: channel_id.as_str().as_bytes(),
                },
            )
            .map_err(|_| CryptoError::Encrypt("aead encryption failed".into()))?;

        Ok(DmE2eeEnvelope {
            version: DM_E2EE_ENVELOPE_VERSION,
            nonce: STANDARD.encode(nonce),
            ciphertext: STANDARD.encode(ciphertext),
            header: None,
        })
    }

    fn decrypt(
        &self,
        channel_id: &ChannelId,
        envelope: &DmE2eeEnvelope,
        private_key: &PrivateKey,
        peer_public_key: &PeerPublicKey,
    ) -> Result<String, CryptoError> {
        if envelope.version != DM_E2EE_ENVELOPE_VERSION {
            return Err(CryptoError::InvalidEnvelope(format!(
                "unsupported envelope version {}",
                envelope.version
            )));
        }
        let nonce = STANDARD
            .decode(&envelope.nonce)
            .map_err(|err| CryptoError::InvalidEnvelope(format!("nonce: {err}")))?;
        if nonce.len() != NONCE_LEN {
            return Err(CryptoError::InvalidEnvelope(format!(
                "nonce must be {NONCE_LEN} bytes, got {}",
                nonce.len()
            )));
        }
        let ciphertext = STANDARD
            .decode(&envelope.ciphertext)
            .map_err(|err| CryptoError::InvalidEnvelope(format!("ciphertext: {err}")))?;

        let cipher = Self::channel_cipher(channel_id, private_key, peer_public_key)?;
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(
                    Nonce::from_slice(&nonce),
                    Payload {
                        msg: &ciphertext,
                        aad: channel_id.as_str().as_bytes(),
                    },
                )
                .map_err(|_| {
                    CryptoError::Decrypt("authentication failed: wrong key or tampered data".into())
                })?,
        );
        String::from_utf8(plaintext.to_vec())
            .map_err(|_| CryptoError::Decrypt("plaintext is not valid utf-8".into()))
    }
}

fn build_dm_hkdf_info(own: &PeerPublicKey, peer: &PeerPublicKey) -> Vec<u8> {
    let (low, high) = if own.0 <= peer.0 { (own, peer) } else { (peer, own) };
    let mut info = Vec::with_capacity(DM_E2EE_INFO_PREFIX.len() + 1 + 64);
    info.extend_from_slice(DM_E2EE_INFO_PREFIX);
    info.push(0);
    info.extend_from_slice(&low.0);
    info.extend_from_slice(&high.0);
    info
}

/// In-memory holder for the unlocked private key.
#[derive(Default)]
pub struct LocalKeyring {
    key: RwLock<Option<PrivateKey>>,
}

impl LocalKeyring {
    pub fn unlocked(key: PrivateKey) -> Self {
        Self {
            key: RwLock::new(Some(key)),
        }
    }

    pub fn unlock(&self, key: PrivateKey) {
        *self.key.write().unwrap_or_else(PoisonError::into_inner) = Some(key);
    }

    /// Drops the key; the secret is zeroized as it goes out of scope.
    pub fn lock(&self) {
        self.key
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl KeyVault for LocalKeyring {
    fn is_private_key_unlocked(&self) -> bool {
        self.key
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn private_key(&self) -> Option<PrivateKey> {
        self.key
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> ChannelId {
        ChannelId::from("1200")
    }

    #[test]
    fn peers_derive_the_same_channel_key() {
        let alice = PrivateKey::generate();
        let bob = PrivateKey::generate();
        let cipher = X25519DmCipher;

        let envelope = cipher
            .encrypt(&channel(), "hello bob", &alice, &bob.public_key(), &UserId::from("2"))
            .expect("encrypt");
        assert_eq!(envelope.version, 1);
        assert!(envelope.header.is_none());

        let plaintext = cipher
            .decrypt(&channel(), &envelope, &bob, &alice.public_key())
            .expect("decrypt");
        assert_eq!(plaintext, "hello bob");
    }

    #[test]
    fn ciphertext_is_bound_to_its_channel() {
        let alice = PrivateKey::generate();
        let bob = PrivateKey::generate();
        let cipher = X25519DmCipher;
        let envelope = cipher
            .encrypt(&channel(), "secret", &alice, &bob.public_key(), &UserId::from("2"))
            .expect("encrypt");

        let err = cipher
            .decrypt(&ChannelId::from("1201"), &envelope, &bob, &alice.public_key())
            .expect_err("other channel must not decrypt");
        assert!(matches!(err, CryptoError::Decrypt(_)));
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let alice = PrivateKey::generate();
        let bob = PrivateKey::generate();
        let mallory = PrivateKey::generate();
        let cipher = X25519DmCipher;
        let envelope = cipher
            .encrypt(&channel(), "secret", &alice, &bob.public_key(), &UserId::from("2"))
            .expect("encrypt");

        let err = cipher
            .decrypt(&channel(), &envelope, &mallory, &alice.public_key())
            .expect_err("wrong recipient");
        assert!(matches!(err, CryptoError::Decrypt(_)));
    }

    #[test]
    fn keyring_lock_hides_the_key() {
        let keyring = LocalKeyring::default();
        assert!(!keyring.is_private_key_unlocked());
        keyring.unlock(PrivateKey::generate());
        assert!(keyring.private_key().is_some());
        keyring.lock();
        assert!(keyring.private_key().is_none());
    }

    #[test]
    fn public_key_round_trips_through_base64() {
        let key = PrivateKey::generate().public_key();
        assert_eq!(PeerPublicKey::from_base64(&key.to_base64()), Ok(key));
        assert!(PeerPublicKey::from_base64("c2hvcnQ=").is_err());
    }
}
