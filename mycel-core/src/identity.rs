//! Identity and crypto: transport keypairs and session keys, wire encryption,
//! publisher signatures and seed certificates.

use chacha20poly1305::aead::{Aead, KeyInit};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::types::Seed;

/// Transport public key (32 bytes, X25519). Exchanged in the connection preamble.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "bytes_32")] [u8; 32]);

mod bytes_32 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }
}

/// X25519 keypair used to agree on a per-connection session key.
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey(X25519PublicKey::from(&secret).to_bytes());
        Self { secret, public }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn shared_secret(&self, other_public: &PublicKey) -> [u8; 32] {
        let other = X25519PublicKey::from(other_public.0);
        self.secret.diffie_hellman(&other).to_bytes()
    }
}

/// Derive a 32-byte key for one direction of a connection from the shared secret.
/// The initiator sends with `"i2r"` and receives with `"r2i"`.
pub fn derive_session_key(shared_secret: &[u8; 32], direction: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"mycel-session-v1");
    hasher.update(shared_secret);
    hasher.update(direction);
    hasher.finalize().into()
}

fn nonce_from_counter(counter: u64) -> [u8; 12] {
    let mut nonce_bytes = [0u8; 12];
    nonce_bytes[4..12].copy_from_slice(&counter.to_le_bytes());
    nonce_bytes
}

/// Wire encryption: ChaCha20-Poly1305. Nonce: 96-bit counter per direction; never reuse.
pub fn encrypt_wire(
    key: &[u8; 32],
    nonce: u64,
    plaintext: &[u8],
) -> Result<Vec<u8>, WireCryptoError> {
    let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| WireCryptoError::Key)?;
    let nonce_bytes = nonce_from_counter(nonce);
    let nonce_arr = chacha20poly1305::aead::Nonce::<chacha20poly1305::ChaCha20Poly1305>::from_slice(
        &nonce_bytes,
    );
    cipher
        .encrypt(nonce_arr, plaintext)
        .map_err(|_| WireCryptoError::Encrypt)
}

/// Wire decryption.
pub fn decrypt_wire(
    key: &[u8; 32],
    nonce: u64,
    ciphertext: &[u8],
) -> Result<Vec<u8>, WireCryptoError> {
    let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| WireCryptoError::Key)?;
    let nonce_bytes = nonce_from_counter(nonce);
    let nonce_arr = chacha20poly1305::aead::Nonce::<chacha20poly1305::ChaCha20Poly1305>::from_slice(
        &nonce_bytes,
    );
    cipher
        .decrypt(nonce_arr, ciphertext)
        .map_err(|_| WireCryptoError::Decrypt)
}

#[derive(Debug, thiserror::Error)]
pub enum WireCryptoError {
    #[error("invalid key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
}

/// Printable publisher identity: `nickname@<hex sha256 of the verifying key>`.
pub fn signature_string(nickname: &str, public_key: &[u8; 32]) -> String {
    format!("{}@{}", nickname, hex::encode(Sha256::digest(public_key)))
}

/// Routing target for a signature string (XOR searches run over this hash).
pub fn signature_hash(signature: &str) -> [u8; 32] {
    Sha256::digest(signature.as_bytes()).into()
}

/// Publisher signing key (Ed25519) with a nickname.
#[derive(Clone, Serialize, Deserialize)]
pub struct DigitalSignature {
    nickname: String,
    #[serde(with = "bytes_32")]
    secret: [u8; 32],
}

impl DigitalSignature {
    pub fn generate(nickname: impl Into<String>) -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        Self {
            nickname: nickname.into(),
            secret: signing.to_bytes(),
        }
    }

    fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&self.secret)
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn signature(&self) -> String {
        signature_string(&self.nickname, self.signing_key().verifying_key().as_bytes())
    }

    /// Sign arbitrary bytes, producing a certificate for them.
    pub fn certify(&self, message: &[u8]) -> Certificate {
        let signing = self.signing_key();
        Certificate {
            nickname: self.nickname.clone(),
            public_key: signing.verifying_key().to_bytes(),
            signature: signing.sign(message).to_bytes().to_vec(),
        }
    }

    /// Attach a certificate over the seed's body.
    pub fn sign_seed(&self, seed: &mut Seed) -> Result<(), CertificateError> {
        let body = seed.signing_bytes().map_err(|_| CertificateError::Malformed)?;
        seed.certificate = Some(self.certify(&body));
        Ok(())
    }
}

impl std::fmt::Debug for DigitalSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigitalSignature")
            .field("signature", &self.signature())
            .finish()
    }
}

/// Binds a signed item to its publisher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub nickname: String,
    #[serde(with = "bytes_32")]
    pub public_key: [u8; 32],
    pub signature: Vec<u8>,
}

impl Certificate {
    pub fn signature(&self) -> String {
        signature_string(&self.nickname, &self.public_key)
    }

    pub fn verify(&self, message: &[u8]) -> Result<(), CertificateError> {
        let key =
            VerifyingKey::from_bytes(&self.public_key).map_err(|_| CertificateError::InvalidKey)?;
        let sig = ed25519_dalek::Signature::from_slice(&self.signature)
            .map_err(|_| CertificateError::Malformed)?;
        key.verify(message, &sig)
            .map_err(|_| CertificateError::BadSignature)
    }
}

/// Verify a seed's certificate against its body.
pub fn verify_seed(seed: &Seed) -> Result<(), CertificateError> {
    let cert = seed.certificate.as_ref().ok_or(CertificateError::Missing)?;
    let body = seed.signing_bytes().map_err(|_| CertificateError::Malformed)?;
    cert.verify(&body)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CertificateError {
    #[error("certificate missing")]
    Missing,
    #[error("invalid verifying key")]
    InvalidKey,
    #[error("malformed signature")]
    Malformed,
    #[error("signature does not verify")]
    BadSignature,
}
