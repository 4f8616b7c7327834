//! Layer payload transform: snappy compression then ChaCha20-Poly1305 sealing.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;

use super::StoreError;
use crate::types::{CodecParams, CompressionAlgorithm, CryptoAlgorithm};

// Keys are content-derived and used once per payload.
const CONTENT_NONCE: [u8; 12] = [0u8; 12];

fn cipher(key: &[u8]) -> Result<ChaCha20Poly1305, StoreError> {
    ChaCha20Poly1305::new_from_slice(key).map_err(|_| StoreError::Codec("crypto key must be 32 bytes".into()))
}

fn nonce() -> &'static chacha20poly1305::aead::Nonce<ChaCha20Poly1305> {
    chacha20poly1305::aead::Nonce::<ChaCha20Poly1305>::from_slice(&CONTENT_NONCE)
}

pub fn encode_payload(data: Vec<u8>, params: &CodecParams) -> Result<Vec<u8>, StoreError> {
    let compressed = match params.compression {
        CompressionAlgorithm::None => data,
        CompressionAlgorithm::Snappy => snap::raw::Encoder::new()
            .compress_vec(&data)
            .map_err(|e| StoreError::Codec(e.to_string()))?,
    };
    match params.crypto {
        CryptoAlgorithm::None => Ok(compressed),
        CryptoAlgorithm::ChaCha20Poly1305 => cipher(&params.crypto_key)?
            .encrypt(nonce(), compressed.as_slice())
            .map_err(|_| StoreError::Codec("encryption failed".into())),
    }
}

pub fn decode_payload(data: Vec<u8>, params: &CodecParams) -> Result<Vec<u8>, StoreError> {
    let opened = match params.crypto {
        CryptoAlgorithm::None => data,
        CryptoAlgorithm::ChaCha20Poly1305 => cipher(&params.crypto_key)?
            .decrypt(nonce(), data.as_slice())
            .map_err(|_| StoreError::Codec("decryption failed".into()))?,
    };
    match params.compression {
        CompressionAlgorithm::None => Ok(opened),
        CompressionAlgorithm::Snappy => snap::raw::Decoder::new()
            .decompress_vec(&opened)
            .map_err(|e| StoreError::Codec(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealed_params() -> CodecParams {
        CodecParams {
            compression: CompressionAlgorithm::Snappy,
            crypto: CryptoAlgorithm::ChaCha20Poly1305,
            crypto_key: vec![9u8; 32],
        }
    }

    #[test]
    fn sealed_roundtrip() {
        let data = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaabbbbbbbbbbbbbbbbbbbbbbbbb".to_vec();
        let enc = encode_payload(data.clone(), &sealed_params()).unwrap();
        assert_ne!(enc, data);
        assert_eq!(decode_payload(enc, &sealed_params()).unwrap(), data);
    }

    #[test]
    fn wrong_key_fails() {
        let enc = encode_payload(b"secret".to_vec(), &sealed_params()).unwrap();
        let mut params = sealed_params();
        params.crypto_key = vec![1u8; 32];
        assert!(matches!(
            decode_payload(enc, &params),
            Err(StoreError::Codec(_))
        ));
    }

    #[test]
    fn short_key_rejected() {
        let mut params = sealed_params();
        params.crypto_key = vec![1u8; 5];
        assert!(encode_payload(b"x".to_vec(), &params).is_err());
    }
}
