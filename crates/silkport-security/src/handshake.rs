//! Both sides of the handshake that establishes the security features of a
//! connection between two Silkroad Online participants.
//!
//! The handshake always happens between an *active* and a *passive* party.
//! The active party opens the exchange and decides which features are used;
//! the passive party accepts whatever the active party selected. For the
//! official game the server is the active party and the client the passive
//! one, and emulating either means keeping those roles.
//!
//! The key agreement is a Diffie–Hellman style exchange over a 32-bit modular
//! field: each party raises the shared generator to a private exponent,
//! exchanges the result, and raises the received value to its own exponent
//! again, arriving at the same shared secret without ever transmitting it.
//! The shared secret keys an intermediate Blowfish cipher used to prove, in
//! both directions, that the exchange produced the same value, and finally
//! keys the session cipher that everything after the handshake is encrypted
//! with.
//!
//! This module only computes the exchanged values; it does not transfer them.
//! Wiring the exchange onto an actual connection is done by the session layer
//! on top, which also installs the resulting [SessionEncryption] and the
//! count/checksum seeds into the frame path.

use crate::{blowfish_from_u64, CipherBlock, SecurityError, SessionEncryption};
use bitflags::bitflags;
use blowfish::cipher::{BlockDecrypt, BlockEncrypt};
use rand::random;

bitflags! {
    /// The security features an active party can request for a connection.
    ///
    /// The raw byte travels as the leading byte of the setup frame, so the
    /// values are fixed by the wire protocol.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProtocolOptions: u8 {
        /// Encrypt every frame envelope with the negotiated session cipher.
        const ENCRYPTION = 0x02;
        /// Generate and validate the per-frame count and checksum bytes.
        const ERROR_DETECTION = 0x04;
        /// Perform the public value exchange deriving the shared secret.
        const KEY_EXCHANGE = 0x08;
        /// Marks the frame carrying the active party's challenge.
        const KEY_CHALLENGE = 0x10;
    }
}

impl Default for ProtocolOptions {
    fn default() -> Self {
        ProtocolOptions::ENCRYPTION | ProtocolOptions::ERROR_DETECTION | ProtocolOptions::KEY_EXCHANGE
    }
}

/// Seeds for the count and checksum generators, exchanged in the clear as
/// part of the setup frame.
#[derive(Debug, Copy, Clone)]
pub struct CheckSeeds {
    pub count_seed: u32,
    pub crc_seed: u32,
}

/// The public key exchange values the active party opens the handshake with.
#[derive(Debug, Copy, Clone)]
pub struct ExchangeSeeds {
    /// Plaintext nonce carried along with the exchange. Not part of the key
    /// derivation, but official peers transmit it and expect it present.
    pub seed: u64,
    /// Seed the final session key is derived from, together with the shared
    /// secret.
    pub handshake_seed: u64,
    /// The generator `g` of the exchange.
    pub generator: u32,
    /// The modulus `p` of the exchange.
    pub prime: u32,
    /// The active party's public value `g^x mod p`.
    pub public: u32,
}

/// Everything the active party sends in its opening setup frame.
#[derive(Debug, Copy, Clone)]
pub struct HandshakeInit {
    pub options: ProtocolOptions,
    pub checks: Option<CheckSeeds>,
    pub exchange: Option<ExchangeSeeds>,
}

#[derive(Copy, Clone)]
struct ActiveExchange {
    handshake_seed: u64,
    private: u32,
    prime: u32,
    public: u32,
}

#[derive(Default)]
enum ActiveState {
    #[default]
    Uninitialized,
    Started {
        exchange: Option<ActiveExchange>,
    },
    Challenged {
        session_key: u64,
    },
    FinishedEmpty,
}

/// The active part of the handshake.
///
/// The active party generates all key material, opens the exchange and
/// challenges the passive party before completing. An exchange with all
/// features enabled goes through [initialize][Self::initialize],
/// [start_challenge][Self::start_challenge] (with the passive party's
/// response plugged in) and [finish][Self::finish]:
///
/// ```
/// # use silkport_security::{ActiveHandshake, PassiveHandshake, ProtocolOptions};
/// let mut active = ActiveHandshake::default();
/// let init = active
///     .initialize(ProtocolOptions::default())
///     .expect("should be able to open the handshake");
/// # let mut passive = PassiveHandshake::default();
/// // Transfer `init` to the passive side, which answers with its public
/// // value and its proof of the shared secret.
/// # let (proof, public) = passive.initialize(init.exchange).unwrap().unwrap();
/// let challenge = active
///     .start_challenge(public, proof)
///     .expect("the proof should check out");
/// // Transfer the challenge; once the passive side acknowledges it, the
/// // handshake is complete on both ends.
/// # passive.finish(challenge).unwrap();
/// let encryption = active
///     .finish()
///     .expect("should have finished the handshake")
///     .expect("encryption should have been established");
/// ```
#[derive(Default)]
pub struct ActiveHandshake {
    state: ActiveState,
}

impl ActiveHandshake {
    /// Opens the handshake with the given feature selection.
    ///
    /// Generates the private key material and returns the [HandshakeInit]
    /// to transfer to the passive party. With [ProtocolOptions::ENCRYPTION]
    /// and [ProtocolOptions::KEY_EXCHANGE] requested this must be followed by
    /// [start_challenge][Self::start_challenge] once the response arrives;
    /// without them the handshake is already complete. The two bits only
    /// work as a pair; selecting one without the other returns
    /// [SecurityError::InvalidOptions].
    ///
    /// Returns [SecurityError::AlreadyInitialized] if the handshake was
    /// already opened.
    pub fn initialize(&mut self, options: ProtocolOptions) -> Result<HandshakeInit, SecurityError> {
        if !matches!(self.state, ActiveState::Uninitialized) {
            return Err(SecurityError::AlreadyInitialized);
        }

        let exchange_bits = ProtocolOptions::ENCRYPTION | ProtocolOptions::KEY_EXCHANGE;
        if options.intersects(exchange_bits) && !options.contains(exchange_bits) {
            return Err(SecurityError::InvalidOptions);
        }

        let checks = options
            .contains(ProtocolOptions::ERROR_DETECTION)
            .then(|| CheckSeeds {
                count_seed: u32::from(random::<u8>()),
                crc_seed: u32::from(random::<u8>()),
            });

        if options.contains(exchange_bits) {
            let handshake_seed = random::<u64>();
            let private = random::<u32>() & 0x7FFF_FFFF;
            let generator = random::<u32>() & 0x7FFF_FFFF;
            // Forced odd so the modular exponentiation never divides by zero.
            let prime = (random::<u32>() & 0x7FFF_FFFF) | 1;
            let public = mod_exp(generator, private, prime);

            self.state = ActiveState::Started {
                exchange: Some(ActiveExchange {
                    handshake_seed,
                    private,
                    prime,
                    public,
                }),
            };

            Ok(HandshakeInit {
                options,
                checks,
                exchange: Some(ExchangeSeeds {
                    seed: random::<u64>(),
                    handshake_seed,
                    generator,
                    prime,
                    public,
                }),
            })
        } else {
            self.state = ActiveState::FinishedEmpty;
            Ok(HandshakeInit {
                options,
                checks,
                exchange: None,
            })
        }
    }

    /// Initialize with a predefined set of values instead of random ones,
    /// resulting in a deterministic handshake.
    #[allow(unused)]
    fn initialize_with(&mut self, exchange: Option<ActiveExchange>) {
        self.state = ActiveState::Started { exchange };
    }

    /// Verifies the passive party's proof and produces the challenge.
    ///
    /// `passive_public` and `proof` are the two values the passive party
    /// answered the opening frame with. If the proof matches the secret we
    /// derived ourselves, the returned challenge must be transferred back;
    /// it lets the passive party perform the same verification in reverse.
    ///
    /// Returns [SecurityError::Uninitialized] when the exchange wasn't
    /// opened with encryption enabled and [SecurityError::ChallengeMismatch]
    /// when the proof disagrees with our own calculation.
    pub fn start_challenge(
        &mut self,
        passive_public: u32,
        proof: u64,
    ) -> Result<u64, SecurityError> {
        let ActiveState::Started { exchange } = self.state else {
            return Err(SecurityError::Uninitialized);
        };
        let Some(exchange) = exchange else {
            return Err(SecurityError::Uninitialized);
        };

        let shared_secret = mod_exp(passive_public, exchange.private, exchange.prime);
        let intermediate = blowfish_from_u64(scramble(
            join(exchange.public, passive_public),
            shared_secret,
            shared_secret as u8 & 0x03,
        ));

        let mut received = proof.to_le_bytes();
        intermediate.decrypt_block(CipherBlock::from_mut_slice(&mut received));
        let received = u64::from_le_bytes(received);
        let calculated = scramble(
            join(passive_public, exchange.public),
            shared_secret,
            passive_public as u8 & 0x07,
        );
        if received != calculated {
            return Err(SecurityError::ChallengeMismatch {
                received,
                calculated,
            });
        }

        let mut challenge = scramble(
            join(exchange.public, passive_public),
            shared_secret,
            exchange.public as u8 & 0x07,
        )
        .to_le_bytes();
        intermediate.encrypt_block(CipherBlock::from_mut_slice(&mut challenge));

        self.state = ActiveState::Challenged {
            session_key: scramble(exchange.handshake_seed, shared_secret, 3),
        };

        Ok(u64::from_le_bytes(challenge))
    }

    /// Finishes the handshake, producing the session encryption if the
    /// feature selection included one.
    ///
    /// Returns [SecurityError::ExchangeUnfinished] when encryption was
    /// requested but the challenge hasn't been produced yet.
    pub fn finish(self) -> Result<Option<SessionEncryption>, SecurityError> {
        match self.state {
            ActiveState::Challenged { session_key } => {
                Ok(Some(SessionEncryption::from_key(session_key)))
            }
            ActiveState::FinishedEmpty => Ok(None),
            ActiveState::Started { exchange: None } => Ok(None),
            _ => Err(SecurityError::ExchangeUnfinished),
        }
    }
}

struct PassiveExchange {
    intermediate_key: u64,
    active_public: u32,
    passive_public: u32,
    shared_secret: u32,
    handshake_seed: u64,
}

#[derive(Default)]
enum PassiveState {
    #[default]
    Uninitialized,
    Started {
        exchange: Option<PassiveExchange>,
    },
    Challenged {
        session_key: u64,
    },
}

/// The passive part of the handshake.
///
/// The passive party only ever responds: it plugs the active party's opening
/// values into [initialize][Self::initialize], sends back the returned proof
/// and public value, verifies the challenge it receives in
/// [finish][Self::finish], and obtains the negotiated encryption from
/// [done][Self::done]. When the active party didn't request encryption
/// there is nothing to exchange and [done][Self::done] yields `None`.
#[derive(Default)]
pub struct PassiveHandshake {
    state: PassiveState,
}

impl PassiveHandshake {
    /// Feeds in the key exchange values from the active party's opening
    /// frame.
    ///
    /// Returns the pair of `(proof, public)` to answer with, or `None` when
    /// the active party didn't set up an exchange (in which case the
    /// handshake is already as complete as it will get).
    ///
    /// Returns [SecurityError::AlreadyInitialized] when called twice.
    pub fn initialize(
        &mut self,
        init: Option<ExchangeSeeds>,
    ) -> Result<Option<(u64, u32)>, SecurityError> {
        if !matches!(self.state, PassiveState::Uninitialized) {
            return Err(SecurityError::AlreadyInitialized);
        }

        let Some(seeds) = init else {
            self.state = PassiveState::Started { exchange: None };
            return Ok(None);
        };

        let private = random::<u32>();
        let passive_public = mod_exp(seeds.generator, private, seeds.prime);
        let shared_secret = mod_exp(seeds.public, private, seeds.prime);

        let intermediate_key = scramble(
            join(seeds.public, passive_public),
            shared_secret,
            shared_secret as u8 & 0x03,
        );
        let mut proof = scramble(
            join(passive_public, seeds.public),
            shared_secret,
            passive_public as u8 & 0x07,
        )
        .to_le_bytes();
        blowfish_from_u64(intermediate_key).encrypt_block(CipherBlock::from_mut_slice(&mut proof));

        self.state = PassiveState::Started {
            exchange: Some(PassiveExchange {
                intermediate_key,
                active_public: seeds.public,
                passive_public,
                shared_secret,
                handshake_seed: seeds.handshake_seed,
            }),
        };

        Ok(Some((u64::from_le_bytes(proof), passive_public)))
    }

    /// Verifies the challenge received from the active party.
    ///
    /// A matching challenge proves both ends derived the same secret; the
    /// session key is scheduled and the handshake only awaits the final
    /// acknowledgment. A mismatch returns
    /// [SecurityError::ChallengeMismatch] and the connection should be torn
    /// down.
    pub fn finish(&mut self, challenge: u64) -> Result<(), SecurityError> {
        let PassiveState::Started {
            exchange: Some(ref exchange),
        } = self.state
        else {
            return Err(SecurityError::ExchangeUnfinished);
        };

        let mut calculated = scramble(
            join(exchange.active_public, exchange.passive_public),
            exchange.shared_secret,
            exchange.active_public as u8 & 0x07,
        )
        .to_le_bytes();
        blowfish_from_u64(exchange.intermediate_key)
            .encrypt_block(CipherBlock::from_mut_slice(&mut calculated));
        let calculated = u64::from_le_bytes(calculated);
        if calculated != challenge {
            return Err(SecurityError::ChallengeMismatch {
                received: challenge,
                calculated,
            });
        }

        self.state = PassiveState::Challenged {
            session_key: scramble(exchange.handshake_seed, exchange.shared_secret, 3),
        };

        Ok(())
    }

    /// Returns the encryption resulting from the handshake, or `None` when
    /// the active party never requested one.
    ///
    /// Returns [SecurityError::ExchangeUnfinished] when an exchange was
    /// started but the challenge hasn't been verified yet.
    pub fn done(self) -> Result<Option<SessionEncryption>, SecurityError> {
        match self.state {
            PassiveState::Started {
                exchange: Some(_), ..
            } => Err(SecurityError::ExchangeUnfinished),
            PassiveState::Challenged { session_key } => {
                Ok(Some(SessionEncryption::from_key(session_key)))
            }
            _ => Ok(None),
        }
    }
}

/// The byte-wise key transformation both parties apply to exchanged values.
fn scramble(value: u64, key: u32, tweak: u8) -> u64 {
    let key = key.to_le_bytes();
    let mut bytes = value.to_le_bytes();
    for (index, byte) in bytes.iter_mut().enumerate() {
        let mixed = byte.wrapping_add(key[index % 4]).wrapping_add(tweak);
        *byte ^= mixed;
    }
    u64::from_le_bytes(bytes)
}

fn join(low: u32, high: u32) -> u64 {
    (u64::from(high) << 32) | u64::from(low)
}

fn mod_exp(base: u32, mut exponent: u32, modulus: u32) -> u32 {
    // A zero modulus can only come from a misbehaving peer; any constant
    // result keeps the handshake deterministic and lets the challenge fail.
    if modulus == 0 {
        return 0;
    }

    let modulus = u64::from(modulus);
    let mut result: u64 = 1;
    let mut mult = u64::from(base) % modulus;
    while exponent != 0 {
        if exponent & 1 == 1 {
            result = (result * mult) % modulus;
        }
        exponent >>= 1;
        mult = (mult * mult) % modulus;
    }
    result as u32
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn both_sides_agree() {
        let mut active = ActiveHandshake::default();
        let mut passive = PassiveHandshake::default();

        let init = active
            .initialize(ProtocolOptions::default())
            .expect("should be able to initialize");
        assert!(init.exchange.is_some());
        assert!(init.checks.is_some());
        let (proof, public) = passive
            .initialize(init.exchange)
            .expect("should accept initialization")
            .expect("an exchange should be present");
        let challenge = active
            .start_challenge(public, proof)
            .expect("should accept the proof");
        passive
            .finish(challenge)
            .expect("should accept the challenge");
        let active_encryption = active
            .finish()
            .expect("active side should be finished")
            .expect("encryption should be present");
        let passive_encryption = passive
            .done()
            .expect("passive side should be finished")
            .expect("encryption should be present");

        let encrypted = active_encryption
            .encrypt(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08])
            .expect("should be able to encrypt");
        let decrypted = passive_encryption
            .decrypt(&encrypted)
            .expect("should be able to decrypt");

        assert_eq!(
            &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08],
            decrypted.as_ref()
        );
    }

    #[test]
    fn no_encryption_completes_immediately() {
        let mut active = ActiveHandshake::default();
        let mut passive = PassiveHandshake::default();

        let init = active
            .initialize(ProtocolOptions::empty())
            .expect("should be able to initialize");
        assert!(init.exchange.is_none());
        assert!(init.checks.is_none());
        assert!(passive
            .initialize(init.exchange)
            .expect("should accept initialization")
            .is_none());
        assert!(active.finish().expect("should finish").is_none());
        assert!(passive.done().expect("should finish").is_none());
    }

    #[test]
    fn split_encryption_selection_is_rejected() {
        let mut active = ActiveHandshake::default();
        assert!(matches!(
            active.initialize(ProtocolOptions::ENCRYPTION),
            Err(SecurityError::InvalidOptions)
        ));

        let mut active = ActiveHandshake::default();
        assert!(matches!(
            active.initialize(ProtocolOptions::KEY_EXCHANGE | ProtocolOptions::ERROR_DETECTION),
            Err(SecurityError::InvalidOptions)
        ));

        // A failed selection leaves the handshake untouched and reusable.
        let mut active = ActiveHandshake::default();
        assert!(active.initialize(ProtocolOptions::ENCRYPTION).is_err());
        assert!(active.initialize(ProtocolOptions::default()).is_ok());
    }

    #[test]
    fn reproduces_sniffed_challenge() {
        let handshake_seed =
            u64::from_le_bytes([0xbf, 0x89, 0x96, 0x76, 0xae, 0x97, 0x5e, 0x17]);
        let prime = u32::from_le_bytes([0x0d, 0xf4, 0x13, 0x52]);
        let private = 189993144; // brute forced from the capture
        let public = u32::from_le_bytes([0x36, 0x44, 0x96, 0x24]);

        let mut active = ActiveHandshake::default();
        active.initialize_with(Some(ActiveExchange {
            handshake_seed,
            private,
            prime,
            public,
        }));

        let passive_public = u32::from_le_bytes([0x7a, 0x04, 0x39, 0x43]);
        let proof = u64::from_le_bytes([0x69, 0x02, 0xec, 0x3f, 0x16, 0xbb, 0x18, 0x64]);

        let challenge = active.start_challenge(passive_public, proof).unwrap();

        let expected = u64::from_le_bytes([0xbe, 0x6f, 0x5e, 0xd4, 0x19, 0x79, 0x7d, 0x26]);
        assert_eq!(challenge, expected);
        assert!(active.finish().is_ok());
    }

    #[test]
    fn tampered_proof_is_rejected() {
        let mut active = ActiveHandshake::default();
        let mut passive = PassiveHandshake::default();

        let init = active.initialize(ProtocolOptions::default()).unwrap();
        let (proof, public) = passive.initialize(init.exchange).unwrap().unwrap();
        assert!(matches!(
            active.start_challenge(public, proof ^ 1),
            Err(SecurityError::ChallengeMismatch { .. })
        ));
    }
}
