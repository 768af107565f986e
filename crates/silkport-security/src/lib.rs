//! Security primitives for a Silkroad Online style connection.
//!
//! A fully secured connection uses three independent mechanisms, all of which
//! are provided by this crate:
//!
//! - [SessionEncryption]: Blowfish in ECB mode over whole 8-byte blocks,
//!   applied to the frame envelope once a key has been negotiated.
//! - [CountGenerator] and [Checksum]: the per-frame count byte and the
//!   one-byte checksum, both seeded during the handshake, which let the
//!   receiver detect dropped, injected or corrupted frames.
//! - [handshake]: the key-exchange handshake itself, which negotiates the
//!   enabled features and derives the key material for all of the above.
//!
//! None of these talk to a socket; feeding the exchanged values back and
//! forth is the job of a higher layer (see the `silkport-session` crate).

pub mod handshake;

mod checksum;
mod count;

pub use checksum::{Checksum, ChecksumBuilder};
pub use count::CountGenerator;
pub use handshake::{ActiveHandshake, PassiveHandshake, ProtocolOptions};

use blowfish::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use blowfish::BlowfishLE;
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of a single Blowfish block, which everything encrypted must be padded
/// to a multiple of.
pub const CIPHER_BLOCK_SIZE: usize = 8;

type CipherBlock = blowfish::cipher::Block<BlowfishLE>;

#[derive(Error, Debug)]
pub enum SecurityError {
    /// The handshake hasn't been started or hasn't gotten far enough for the
    /// attempted operation.
    #[error("security has not been initialized")]
    Uninitialized,
    /// The handshake was already started or has completed; it would need to be
    /// reset before starting over.
    #[error("security is already initialized")]
    AlreadyInitialized,
    /// The handshake hasn't exchanged the public key material yet, which the
    /// attempted operation requires.
    #[error("the key exchange has not completed yet")]
    ExchangeUnfinished,
    /// The feature selection enabled one of encryption and the key exchange
    /// without the other; the two only work together.
    #[error("encryption and the key exchange must be selected together")]
    InvalidOptions,
    /// Encrypted data must always be a multiple of [CIPHER_BLOCK_SIZE], but
    /// the given data wasn't.
    #[error("{0} is an invalid block length")]
    InvalidBlockLength(usize),
    /// The other side proved knowledge of a different secret than the one we
    /// calculated; the key exchange went wrong on at least one end.
    #[error("local calculated key was {calculated} but received {received}")]
    ChallengeMismatch { received: u64, calculated: u64 },
}

/// The negotiated encryption of an established connection.
///
/// Created by finishing either side of the [handshake]. Encrypts and decrypts
/// frame envelopes in whole blocks; inputs that aren't block-aligned are
/// padded (by the owned variants) or rejected (by the `_mut` variants).
pub struct SessionEncryption {
    blowfish: BlowfishLE,
}

impl SessionEncryption {
    pub(crate) fn from_key(key: u64) -> SessionEncryption {
        SessionEncryption {
            blowfish: blowfish_from_u64(key),
        }
    }

    /// Decrypt an encrypted envelope received from the other side.
    ///
    /// Copies the input and decrypts it block by block. The output may still
    /// carry the padding that was applied before encryption; stripping it is
    /// up to the caller, which knows the plaintext length from the frame
    /// header. Use [decrypt_mut][Self::decrypt_mut()] to avoid the copy.
    pub fn decrypt(&self, data: &[u8]) -> Result<Bytes, SecurityError> {
        let mut result = BytesMut::from(data);
        self.decrypt_mut(&mut result)?;
        Ok(result.freeze())
    }

    /// Decrypt an encrypted envelope in place.
    ///
    /// If the input isn't a multiple of the block length, returns
    /// [SecurityError::InvalidBlockLength].
    pub fn decrypt_mut(&self, data: &mut [u8]) -> Result<(), SecurityError> {
        if data.len() % CIPHER_BLOCK_SIZE != 0 {
            return Err(SecurityError::InvalidBlockLength(data.len()));
        }

        for chunk in data.chunks_mut(CIPHER_BLOCK_SIZE) {
            self.blowfish
                .decrypt_block(CipherBlock::from_mut_slice(chunk));
        }
        Ok(())
    }

    /// Encrypt an envelope to be sent to the other side.
    ///
    /// Copies the input, pads it with zeroes up to the next block boundary and
    /// encrypts it block by block. Use [encrypt_mut][Self::encrypt_mut()] for
    /// encryption in place, with the padding already applied.
    pub fn encrypt(&self, data: &[u8]) -> Result<Bytes, SecurityError> {
        let padded = Self::padded_length(data.len());
        let mut result = BytesMut::with_capacity(padded);
        result.extend_from_slice(data);
        for _ in data.len()..padded {
            result.put_u8(0);
        }
        self.encrypt_mut(&mut result)?;
        Ok(result.freeze())
    }

    /// Encrypt an already block-aligned envelope in place.
    ///
    /// If the input isn't a multiple of the block length, returns
    /// [SecurityError::InvalidBlockLength].
    pub fn encrypt_mut(&self, data: &mut [u8]) -> Result<(), SecurityError> {
        if data.len() % CIPHER_BLOCK_SIZE != 0 {
            return Err(SecurityError::InvalidBlockLength(data.len()));
        }

        for chunk in data.chunks_mut(CIPHER_BLOCK_SIZE) {
            self.blowfish
                .encrypt_block(CipherBlock::from_mut_slice(chunk));
        }
        Ok(())
    }

    /// Find the nearest block-aligned length.
    ///
    /// Given the length of data to encrypt, calculates the length of the
    /// encrypted output including padding. Can at most grow by
    /// `CIPHER_BLOCK_SIZE - 1`, which is `7`.
    pub fn padded_length(given_length: usize) -> usize {
        let remainder = given_length % CIPHER_BLOCK_SIZE;
        if remainder == 0 {
            return given_length;
        }

        given_length + (CIPHER_BLOCK_SIZE - remainder)
    }
}

pub(crate) fn blowfish_from_u64(key: u64) -> BlowfishLE {
    BlowfishLE::new_from_slice(&key.to_le_bytes()).expect("an 8 byte key is always valid")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pads_to_block_boundary() {
        assert_eq!(0, SessionEncryption::padded_length(0));
        assert_eq!(8, SessionEncryption::padded_length(1));
        assert_eq!(8, SessionEncryption::padded_length(8));
        assert_eq!(16, SessionEncryption::padded_length(9));
        assert_eq!(4096, SessionEncryption::padded_length(4093));
    }

    #[test]
    fn round_trips_with_padding() {
        let encryption = SessionEncryption::from_key(0x1122334455667788);
        let encrypted = encryption
            .encrypt(&[0x01, 0x02, 0x03])
            .expect("should encrypt short input");
        assert_eq!(8, encrypted.len());
        let decrypted = encryption
            .decrypt(&encrypted)
            .expect("should decrypt a whole block");
        assert_eq!(&[0x01, 0x02, 0x03], &decrypted[..3]);
    }

    #[test]
    fn rejects_partial_blocks() {
        let encryption = SessionEncryption::from_key(42);
        let mut data = [0u8; 7];
        assert!(matches!(
            encryption.encrypt_mut(&mut data),
            Err(SecurityError::InvalidBlockLength(7))
        ));
        assert!(matches!(
            encryption.decrypt_mut(&mut data),
            Err(SecurityError::InvalidBlockLength(7))
        ));
    }
}
