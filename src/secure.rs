// Secure message envelope: encrypt/decrypt, replay protection, epoch adoption.
// Numan Thabit 2025

use std::net::Ipv6Addr;

use thiserror::Error;
use tracing::debug;

use crate::crypto::aead::{self, AeadError, Nonce, TAG_LEN};
use crate::crypto::keys::KeyManager;
use crate::neighbor::LinkSecurity;
use crate::types::{ExtAddress, Millis};
use crate::wire::{
    Command, MleMessage, SecurityHeader, WireError, SECURITY_HEADER_LEN, SECURITY_LEVEL, SUITE_154,
    SUITE_NONE,
};

/// Classification of an authenticated message for epoch-adoption purposes.
///
/// Returned explicitly by the per-command handlers rather than inferred as a
/// parsing side effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    /// Carries a freshly verified grant; may force epoch adoption.
    Authoritative,
    /// From an established neighbor; adoption only for a single-step jump.
    Peer,
    /// No adoption.
    Unknown,
}

/// Authentication and replay failures. Distinct from [`SecureError::Parse`]
/// because callers react differently (for example re-establishing a link).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SecurityError {
    #[error("authentication tag mismatch")]
    TagMismatch,

    #[error("duplicate frame counter {counter} in epoch {epoch}")]
    Replay { epoch: u32, counter: u32 },

    #[error("stale key epoch {epoch} (current {current})")]
    StaleEpoch { epoch: u32, current: u32 },

    #[error("command {0:?} requires a security envelope")]
    UnsecuredCommand(Command),
}

/// Error from envelope processing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SecureError {
    /// Malformed envelope; dropped with no protocol reaction.
    #[error("parse: {0}")]
    Parse(#[from] WireError),

    /// Authentication or replay failure; may warrant protocol action.
    #[error("security: {0}")]
    Security(#[from] SecurityError),
}

/// Metadata recovered from a decrypted envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxMeta {
    pub key_epoch: u32,
    pub frame_counter: u32,
    pub secured: bool,
}

/// Outcome of applying the epoch-adoption policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochAdoption {
    None,
    Adopted,
    /// Large jump from a peer: re-establish the link instead of trusting it.
    Reestablish,
}

fn build_aad(src: &Ipv6Addr, dst: &Ipv6Addr, header: &SecurityHeader) -> Vec<u8> {
    let mut aad = Vec::with_capacity(32 + SECURITY_HEADER_LEN);
    aad.extend_from_slice(&src.octets());
    aad.extend_from_slice(&dst.octets());
    aad.extend_from_slice(&header.encode());
    aad
}

/// Encrypts a plaintext body (command + TLVs) into a full datagram.
pub fn encrypt(
    keys: &mut KeyManager,
    local_ext: &ExtAddress,
    src: &Ipv6Addr,
    dst: &Ipv6Addr,
    body: &[u8],
) -> Result<Vec<u8>, SecureError> {
    let header = SecurityHeader {
        frame_counter: keys.next_frame_counter(),
        key_epoch: keys.current_epoch(),
    };
    let nonce = Nonce::build(local_ext, header.frame_counter, SECURITY_LEVEL);
    let aad = build_aad(src, dst, &header);

    let ciphertext = aead::seal(keys.current_key(), &nonce, &aad, body)
        .map_err(|_| SecurityError::TagMismatch)?;

    let mut out = Vec::with_capacity(1 + SECURITY_HEADER_LEN + ciphertext.len());
    out.push(SUITE_154);
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Builds an unsecured datagram; only for the no-security command whitelist.
pub fn encode_unsecured(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(SUITE_NONE);
    out.extend_from_slice(body);
    out
}

/// Decrypts a datagram, returning the plaintext body and envelope metadata.
///
/// A missing or short tag is a [`SecureError::Parse`]; a tag that fails to
/// verify is a [`SecureError::Security`].
pub fn decrypt(
    keys: &mut KeyManager,
    sender_ext: &ExtAddress,
    src: &Ipv6Addr,
    dst: &Ipv6Addr,
    datagram: &[u8],
) -> Result<(Vec<u8>, RxMeta), SecureError> {
    if datagram.is_empty() {
        return Err(WireError::BufferTooShort {
            expected: 1,
            actual: 0,
        }
        .into());
    }

    match datagram[0] {
        SUITE_NONE => {
            let body = &datagram[1..];
            let message = MleMessage::parse(body)?;
            if !message.command.allows_no_security() {
                return Err(SecurityError::UnsecuredCommand(message.command).into());
            }
            Ok((
                body.to_vec(),
                RxMeta {
                    key_epoch: 0,
                    frame_counter: 0,
                    secured: false,
                },
            ))
        }
        SUITE_154 => {
            let header = SecurityHeader::parse(&datagram[1..])?;
            let ciphertext = &datagram[1 + SECURITY_HEADER_LEN..];
            if ciphertext.len() < TAG_LEN {
                return Err(WireError::BufferTooShort {
                    expected: TAG_LEN,
                    actual: ciphertext.len(),
                }
                .into());
            }

            let key = keys.key_for_epoch(header.key_epoch);
            let nonce = Nonce::build(sender_ext, header.frame_counter, SECURITY_LEVEL);
            let aad = build_aad(src, dst, &header);

            let plaintext = aead::open(&key, &nonce, &aad, ciphertext).map_err(|err| match err {
                AeadError::Decrypt | AeadError::Encrypt => SecurityError::TagMismatch,
            })?;

            Ok((
                plaintext,
                RxMeta {
                    key_epoch: header.key_epoch,
                    frame_counter: header.frame_counter,
                    secured: true,
                },
            ))
        }
        other => Err(WireError::UnknownSuite(other).into()),
    }
}

/// Replay check for a known neighbor, applied after the tag has verified.
/// On success the stored counters are committed in the same step.
pub fn accept_frame(
    link: &mut LinkSecurity,
    current_epoch: u32,
    meta: &RxMeta,
) -> Result<(), SecurityError> {
    if !meta.secured {
        return Ok(());
    }

    if meta.key_epoch == link.key_epoch {
        if meta.frame_counter < link.mle_frame_counter {
            return Err(SecurityError::Replay {
                epoch: meta.key_epoch,
                counter: meta.frame_counter,
            });
        }
        link.mle_frame_counter = meta.frame_counter.wrapping_add(1);
        return Ok(());
    }

    if meta.key_epoch < link.key_epoch {
        return Err(SecurityError::StaleEpoch {
            epoch: meta.key_epoch,
            current: link.key_epoch,
        });
    }

    // Newer epoch than recorded for this link: only meaningful when it is at
    // least our own current epoch. Counters restart under the new epoch.
    if meta.key_epoch < current_epoch {
        return Err(SecurityError::StaleEpoch {
            epoch: meta.key_epoch,
            current: current_epoch,
        });
    }
    link.key_epoch = meta.key_epoch;
    link.mle_frame_counter = meta.frame_counter.wrapping_add(1);
    link.link_frame_counter = 0;
    Ok(())
}

/// Applies the epoch-adoption policy after a message has authenticated.
pub fn apply_epoch_policy(
    keys: &mut KeyManager,
    class: MessageClass,
    sender_known_valid: bool,
    rx_epoch: u32,
    now: Millis,
) -> EpochAdoption {
    let current = keys.current_epoch();
    if rx_epoch <= current {
        return EpochAdoption::None;
    }

    match class {
        MessageClass::Authoritative => {
            keys.force_epoch(rx_epoch, now);
            debug!(epoch = rx_epoch, "adopted authoritative key epoch");
            EpochAdoption::Adopted
        }
        MessageClass::Peer => {
            if sender_known_valid && rx_epoch == current.wrapping_add(1) {
                if keys.adopt_epoch(rx_epoch, now) {
                    debug!(epoch = rx_epoch, "adopted peer key epoch");
                    EpochAdoption::Adopted
                } else {
                    EpochAdoption::None
                }
            } else if sender_known_valid {
                debug!(
                    epoch = rx_epoch,
                    current, "peer epoch jump too large, re-establishing link"
                );
                EpochAdoption::Reestablish
            } else {
                EpochAdoption::None
            }
        }
        MessageClass::Unknown => EpochAdoption::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{MleWriter, TlvType};

    fn addrs() -> (Ipv6Addr, Ipv6Addr) {
        (
            "fe80::1".parse().unwrap(),
            "fe80::2".parse().unwrap(),
        )
    }

    fn body(command: Command) -> Vec<u8> {
        let mut writer = MleWriter::new(command);
        writer.put_u16(TlvType::SourceAddress, 0x4400).unwrap();
        writer.finish()
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let mut tx = KeyManager::new([7; 16], 3);
        let mut rx = KeyManager::new([7; 16], 3);
        let sender = ExtAddress([0xAB; 8]);
        let (src, dst) = addrs();

        let plain = body(Command::ChildUpdateRequest);
        let datagram = encrypt(&mut tx, &sender, &src, &dst, &plain).unwrap();
        let (recovered, meta) = decrypt(&mut rx, &sender, &src, &dst, &datagram).unwrap();

        assert_eq!(recovered, plain);
        assert_eq!(meta.key_epoch, 3);
        assert_eq!(meta.frame_counter, 0);
        assert!(meta.secured);
    }

    #[test]
    fn any_single_byte_flip_is_a_security_error() {
        let mut tx = KeyManager::new([7; 16], 3);
        let sender = ExtAddress([0xAB; 8]);
        let (src, dst) = addrs();
        let datagram = encrypt(&mut tx, &sender, &src, &dst, &body(Command::DataRequest)).unwrap();

        // Skip the suite byte and security header; flipping those is a parse
        // concern. Every ciphertext and tag byte must fail closed.
        for i in (1 + SECURITY_HEADER_LEN)..datagram.len() {
            let mut tampered = datagram.clone();
            tampered[i] ^= 0x80;
            let mut rx = KeyManager::new([7; 16], 3);
            let err = decrypt(&mut rx, &sender, &src, &dst, &tampered).unwrap_err();
            assert_eq!(
                err,
                SecureError::Security(SecurityError::TagMismatch),
                "byte {i}"
            );
        }
    }

    #[test]
    fn short_tag_is_a_parse_error() {
        let mut tx = KeyManager::new([7; 16], 3);
        let sender = ExtAddress([0xAB; 8]);
        let (src, dst) = addrs();
        let datagram = encrypt(&mut tx, &sender, &src, &dst, &body(Command::DataRequest)).unwrap();

        let truncated = &datagram[..1 + SECURITY_HEADER_LEN + 2];
        let mut rx = KeyManager::new([7; 16], 3);
        assert!(matches!(
            decrypt(&mut rx, &sender, &src, &dst, truncated),
            Err(SecureError::Parse(_))
        ));
    }

    #[test]
    fn wrong_receiver_address_fails_authentication() {
        let mut tx = KeyManager::new([7; 16], 3);
        let sender = ExtAddress([0xAB; 8]);
        let (src, dst) = addrs();
        let datagram =
            encrypt(&mut tx, &sender, &src, &dst, &body(Command::Advertisement)).unwrap();

        let other: Ipv6Addr = "fe80::3".parse().unwrap();
        let mut rx = KeyManager::new([7; 16], 3);
        assert!(matches!(
            decrypt(&mut rx, &sender, &src, &other, &datagram),
            Err(SecureError::Security(SecurityError::TagMismatch))
        ));
    }

    #[test]
    fn unsecured_whitelist_enforced() {
        let announce = encode_unsecured(&body(Command::Announce));
        let (src, dst) = addrs();
        let sender = ExtAddress([1; 8]);
        let mut rx = KeyManager::new([7; 16], 3);
        assert!(decrypt(&mut rx, &sender, &src, &dst, &announce).is_ok());

        let parent_req = encode_unsecured(&body(Command::ParentRequest));
        assert!(matches!(
            decrypt(&mut rx, &sender, &src, &dst, &parent_req),
            Err(SecureError::Security(SecurityError::UnsecuredCommand(
                Command::ParentRequest
            )))
        ));
    }

    #[test]
    fn replay_rejected_next_counter_accepted() {
        let mut link = LinkSecurity {
            key_epoch: 5,
            mle_frame_counter: 10, // last seen was 9
            link_frame_counter: 3,
        };

        for counter in 0..10 {
            let meta = RxMeta {
                key_epoch: 5,
                frame_counter: counter,
                secured: true,
            };
            assert!(matches!(
                accept_frame(&mut link, 5, &meta),
                Err(SecurityError::Replay { .. })
            ));
        }

        let meta = RxMeta {
            key_epoch: 5,
            frame_counter: 10,
            secured: true,
        };
        assert!(accept_frame(&mut link, 5, &meta).is_ok());
        assert_eq!(link.mle_frame_counter, 11);

        // Gaps are allowed.
        let meta = RxMeta {
            key_epoch: 5,
            frame_counter: 20,
            secured: true,
        };
        assert!(accept_frame(&mut link, 5, &meta).is_ok());
        assert_eq!(link.mle_frame_counter, 21);
    }

    #[test]
    fn newer_epoch_resets_link_counters() {
        let mut link = LinkSecurity {
            key_epoch: 5,
            mle_frame_counter: 100,
            link_frame_counter: 50,
        };
        let meta = RxMeta {
            key_epoch: 6,
            frame_counter: 2,
            secured: true,
        };
        assert!(accept_frame(&mut link, 6, &meta).is_ok());
        assert_eq!(
            link,
            LinkSecurity {
                key_epoch: 6,
                mle_frame_counter: 3,
                link_frame_counter: 0,
            }
        );
    }

    #[test]
    fn older_epoch_is_stale() {
        let mut link = LinkSecurity {
            key_epoch: 5,
            mle_frame_counter: 1,
            link_frame_counter: 0,
        };
        let meta = RxMeta {
            key_epoch: 4,
            frame_counter: 1000,
            secured: true,
        };
        assert!(matches!(
            accept_frame(&mut link, 5, &meta),
            Err(SecurityError::StaleEpoch { .. })
        ));
    }

    #[test]
    fn peer_adopts_single_step_only() {
        let mut keys = KeyManager::new([1; 16], 10);
        assert_eq!(
            apply_epoch_policy(&mut keys, MessageClass::Peer, true, 11, 0),
            EpochAdoption::Adopted
        );
        assert_eq!(keys.current_epoch(), 11);

        // Guard is active now; force it aside by using a fresh manager.
        let mut keys = KeyManager::new([1; 16], 10);
        assert_eq!(
            apply_epoch_policy(&mut keys, MessageClass::Peer, true, 12, 0),
            EpochAdoption::Reestablish
        );
        assert_eq!(keys.current_epoch(), 10);
    }

    #[test]
    fn unknown_class_never_adopts() {
        let mut keys = KeyManager::new([1; 16], 10);
        assert_eq!(
            apply_epoch_policy(&mut keys, MessageClass::Unknown, true, 11, 0),
            EpochAdoption::None
        );
        assert_eq!(keys.current_epoch(), 10);
    }

    #[test]
    fn authoritative_adopts_any_jump() {
        let mut keys = KeyManager::new([1; 16], 10);
        assert_eq!(
            apply_epoch_policy(&mut keys, MessageClass::Authoritative, false, 50, 0),
            EpochAdoption::Adopted
        );
        assert_eq!(keys.current_epoch(), 50);
    }
}
