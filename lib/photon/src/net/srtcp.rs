use crate::net::support::{ErrorType, Frame, PrimaryHandler, PrimaryOutcome, TransportResult};
use byteorder::{BigEndian, ByteOrder};
use hashbrown::HashSet;
use muon::crypto::{self, AES_KEY_SIZE, AUTH_TAG_SIZE, IV_SIZE, SALT_SIZE};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Fixed RTCP header plus the sender SSRC; this prefix is never encrypted.
pub const RTCP_HEADER_SIZE: usize = 8;
/// Trailing SRTCP index word (E-flag plus 31-bit index).
pub const SRTCP_INDEX_SIZE: usize = 4;

const MIN_PACKET_SIZE: usize = RTCP_HEADER_SIZE + SRTCP_INDEX_SIZE + AUTH_TAG_SIZE;
const SRTCP_E_FLAG: u32 = 0x8000_0000;
const REPLAY_WINDOW_SIZE: usize = 512;

/// Session key material for one direction of an SRTCP stream.
#[derive(Clone)]
pub struct StreamKeys {
    pub enc: [u8; AES_KEY_SIZE],
    pub auth: [u8; AES_KEY_SIZE],
    pub salt: [u8; SALT_SIZE],
}

impl StreamKeys {
    #[inline]
    pub fn new(
        enc: [u8; AES_KEY_SIZE],
        auth: [u8; AES_KEY_SIZE],
        salt: [u8; SALT_SIZE],
    ) -> StreamKeys {
        StreamKeys { enc, auth, salt }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CipherKind {
    /// Authentication only, payload left in the clear.
    Null,
    Aes128Ctr,
}

/// Cryptographic state for securing outbound and unsecuring inbound RTCP
/// packets. Runs on the processor thread only; the replay window is private
/// to this context.
pub struct SrtcpContext {
    local: StreamKeys,
    remote: StreamKeys,
    cipher: CipherKind,
    roc: u32,
    seen_tags: HashSet<[u8; AUTH_TAG_SIZE]>,
    tag_order: VecDeque<[u8; AUTH_TAG_SIZE]>,
}

impl SrtcpContext {
    #[inline]
    pub fn new(local: StreamKeys, remote: StreamKeys) -> SrtcpContext {
        Self::with_cipher(local, remote, CipherKind::Aes128Ctr)
    }

    #[inline]
    pub fn with_cipher(local: StreamKeys, remote: StreamKeys, cipher: CipherKind) -> SrtcpContext {
        SrtcpContext {
            local,
            remote,
            cipher,
            roc: 0,
            seen_tags: HashSet::new(),
            tag_order: VecDeque::new(),
        }
    }

    /// Builds the counter-mode IV: ssrc and sequence at their wire offsets,
    /// zero-padded to 16 bytes, XORed with the session salt.
    fn create_iv(salt: &[u8; SALT_SIZE], ssrc: u32, seq: u32) -> [u8; IV_SIZE] {
        let mut iv = [0u8; IV_SIZE];

        BigEndian::write_u32(&mut iv[4..8], ssrc);
        BigEndian::write_u32(&mut iv[10..14], seq);

        for (byte, salt_byte) in iv.iter_mut().zip(salt.iter()) {
            *byte ^= salt_byte;
        }

        iv
    }

    /// Encrypts the supplied plaintext region in place with the local keys.
    /// No-op under the null cipher.
    pub fn encrypt(&self, ssrc: u32, seq: u32, buffer: &mut [u8]) {
        if self.cipher == CipherKind::Null {
            return;
        }

        let iv = Self::create_iv(&self.local.salt, ssrc, seq);
        crypto::ctr_apply(&self.local.enc, &iv, buffer);
    }

    /// Computes the truncated HMAC-SHA1 tag over the packet prefix and the
    /// rollover counter, writing it into the trailing tag bytes.
    pub fn add_auth_tag(&self, buffer: &mut [u8]) -> TransportResult<()> {
        if buffer.len() <= AUTH_TAG_SIZE {
            return Err(ErrorType::InvalidValue);
        }

        let split = buffer.len() - AUTH_TAG_SIZE;
        let tag = crypto::auth_tag(&self.local.auth, &buffer[..split], &self.roc.to_ne_bytes());

        buffer[split..].copy_from_slice(&tag);
        Ok(())
    }

    /// Recomputes the tag with the remote authentication key and compares it
    /// in constant time, then runs the tag digest through the replay window.
    /// A repeated digest reports `InvalidValue`.
    pub fn verify_auth_tag(&mut self, buffer: &[u8]) -> TransportResult<()> {
        if buffer.len() <= AUTH_TAG_SIZE {
            return Err(ErrorType::InvalidValue);
        }

        let split = buffer.len() - AUTH_TAG_SIZE;
        let expected = crypto::auth_tag(&self.remote.auth, &buffer[..split], &self.roc.to_ne_bytes());

        if !crypto::tags_match(&expected, &buffer[split..]) {
            return Err(ErrorType::AuthTagMismatch);
        }

        let mut digest = [0u8; AUTH_TAG_SIZE];
        digest.copy_from_slice(&buffer[split..]);

        if !self.seen_tags.insert(digest) {
            return Err(ErrorType::InvalidValue);
        }

        self.tag_order.push_back(digest);
        if self.tag_order.len() > REPLAY_WINDOW_SIZE {
            let evicted = self.tag_order.pop_front().expect("Replay window out of step");
            self.seen_tags.remove(&evicted);
        }

        Ok(())
    }

    /// Decrypts the ciphertext portion of a full packet in place with the
    /// remote keys, leaving the RTCP header, SRTCP index and tag untouched.
    pub fn decrypt(&self, ssrc: u32, seq: u32, buffer: &mut [u8]) -> TransportResult<()> {
        if self.cipher == CipherKind::Null {
            return Ok(());
        }

        if buffer.len() < MIN_PACKET_SIZE {
            return Err(ErrorType::InvalidValue);
        }

        let end = buffer.len() - AUTH_TAG_SIZE - SRTCP_INDEX_SIZE;
        let iv = Self::create_iv(&self.remote.salt, ssrc, seq);

        crypto::ctr_apply(&self.remote.enc, &iv, &mut buffer[RTCP_HEADER_SIZE..end]);
        Ok(())
    }

    /// Secures a fully framed outbound packet in place. The caller supplies
    /// the trailing layout: payload, 4-byte SRTCP index, 10 bytes of tag
    /// space. Sets the E flag when the payload is encrypted.
    pub fn protect(&self, buffer: &mut [u8]) -> TransportResult<()> {
        if buffer.len() < MIN_PACKET_SIZE {
            return Err(ErrorType::InvalidValue);
        }

        let index_at = buffer.len() - AUTH_TAG_SIZE - SRTCP_INDEX_SIZE;
        let ssrc = BigEndian::read_u32(&buffer[4..8]);
        let seq = BigEndian::read_u32(&buffer[index_at..index_at + SRTCP_INDEX_SIZE]) & !SRTCP_E_FLAG;

        if self.cipher == CipherKind::Aes128Ctr {
            self.encrypt(ssrc, seq, &mut buffer[RTCP_HEADER_SIZE..index_at]);
            BigEndian::write_u32(
                &mut buffer[index_at..index_at + SRTCP_INDEX_SIZE],
                seq | SRTCP_E_FLAG,
            );
        }

        self.add_auth_tag(buffer)
    }

    /// Authenticates and decrypts a fully framed inbound packet in place.
    /// The tag is verified and the replay window consulted before any
    /// decryption output is trusted.
    pub fn unprotect(&mut self, buffer: &mut [u8]) -> TransportResult<()> {
        if buffer.len() < MIN_PACKET_SIZE {
            return Err(ErrorType::InvalidValue);
        }

        self.verify_auth_tag(buffer)?;

        let index_at = buffer.len() - AUTH_TAG_SIZE - SRTCP_INDEX_SIZE;
        let index_word = BigEndian::read_u32(&buffer[index_at..index_at + SRTCP_INDEX_SIZE]);
        let ssrc = BigEndian::read_u32(&buffer[4..8]);

        if index_word & SRTCP_E_FLAG != 0 {
            if self.cipher == CipherKind::Null {
                return Err(ErrorType::Crypto);
            }

            self.decrypt(ssrc, index_word & !SRTCP_E_FLAG, buffer)?;
        }

        Ok(())
    }
}

/// Wires the transform into a reception session: RTCP datagrams (version 2,
/// packet types 200-204) are unsecured and surfaced as frames with the
/// SRTCP trailer stripped; everything else passes to the next primary.
pub fn handler(context: Arc<Mutex<SrtcpContext>>) -> PrimaryHandler {
    Box::new(move |data, flags| {
        if !looks_like_rtcp(data) {
            return Ok(PrimaryOutcome::NotHandled);
        }

        let mut packet = data.to_vec();

        let mut context = context.lock().expect("SRTCP context poisoned");
        context.unprotect(&mut packet)?;

        packet.truncate(packet.len() - AUTH_TAG_SIZE - SRTCP_INDEX_SIZE);
        Ok(PrimaryOutcome::Modified(Frame::new(packet, flags)))
    })
}

#[inline]
fn looks_like_rtcp(data: &[u8]) -> bool {
    data.len() >= MIN_PACKET_SIZE && data[0] >> 6 == 2 && (200..=204).contains(&data[1])
}

#[cfg(test)]
mod tests {
    use super::*;

    const SSRC: u32 = 0xDEAD_BEEF;
    const SEQ: u32 = 0x0000_0001;
    const PAYLOAD: &[u8] = b"hello rtcp world!!\0\0";

    fn test_keys() -> StreamKeys {
        StreamKeys::new([0x2b; AES_KEY_SIZE], [0x2b; AES_KEY_SIZE], [0x2b; SALT_SIZE])
    }

    fn context() -> SrtcpContext {
        SrtcpContext::new(test_keys(), test_keys())
    }

    /// Sender report carrying `PAYLOAD`, with the SRTCP index word set and
    /// zeroed tag space.
    fn framed_packet() -> Vec<u8> {
        let total = RTCP_HEADER_SIZE + PAYLOAD.len() + SRTCP_INDEX_SIZE + AUTH_TAG_SIZE;
        let mut packet = vec![0u8; total];

        packet[0] = 0x80;
        packet[1] = 200;
        BigEndian::write_u16(&mut packet[2..4], ((RTCP_HEADER_SIZE + PAYLOAD.len()) / 4 - 1) as u16);
        BigEndian::write_u32(&mut packet[4..8], SSRC);
        packet[RTCP_HEADER_SIZE..RTCP_HEADER_SIZE + PAYLOAD.len()].copy_from_slice(PAYLOAD);

        let index_at = total - AUTH_TAG_SIZE - SRTCP_INDEX_SIZE;
        BigEndian::write_u32(&mut packet[index_at..index_at + SRTCP_INDEX_SIZE], SEQ);

        packet
    }

    #[test]
    fn test_iv_layout() {
        let iv = SrtcpContext::create_iv(&[0u8; SALT_SIZE], SSRC, SEQ);

        assert_eq!(&iv[..4], &[0, 0, 0, 0]);
        assert_eq!(&iv[4..8], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(&iv[8..10], &[0, 0]);
        assert_eq!(&iv[10..14], &[0, 0, 0, 1]);
        assert_eq!(&iv[14..], &[0, 0]);
    }

    #[test]
    fn test_iv_salted() {
        let salt = [0x2b; SALT_SIZE];
        let iv = SrtcpContext::create_iv(&salt, 0, 0);

        assert_eq!(iv, salt);
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let context = context();
        let mut packet = framed_packet();

        let index_at = packet.len() - AUTH_TAG_SIZE - SRTCP_INDEX_SIZE;
        context.encrypt(SSRC, SEQ, &mut packet[RTCP_HEADER_SIZE..index_at]);

        assert_ne!(&packet[RTCP_HEADER_SIZE..index_at], PAYLOAD);

        context.decrypt(SSRC, SEQ, &mut packet).unwrap();

        assert_eq!(&packet[RTCP_HEADER_SIZE..index_at], PAYLOAD);
    }

    #[test]
    fn test_protect_deterministic() {
        let context = context();

        let mut first = framed_packet();
        let mut second = framed_packet();

        context.protect(&mut first).unwrap();
        context.protect(&mut second).unwrap();

        assert_eq!(first, second);
        assert_ne!(&first[RTCP_HEADER_SIZE..RTCP_HEADER_SIZE + PAYLOAD.len()], PAYLOAD);
    }

    #[test]
    fn test_protect_unprotect_roundtrip() {
        let sender = context();
        let mut receiver = context();

        let mut packet = framed_packet();
        sender.protect(&mut packet).unwrap();

        receiver.unprotect(&mut packet).unwrap();

        assert_eq!(
            &packet[RTCP_HEADER_SIZE..RTCP_HEADER_SIZE + PAYLOAD.len()],
            PAYLOAD
        );
    }

    #[test]
    fn test_tamper_flips_verification() {
        let sender = context();

        let mut packet = framed_packet();
        sender.protect(&mut packet).unwrap();

        for position in [0, 5, RTCP_HEADER_SIZE + 3, packet.len() - 1] {
            let mut receiver = context();
            let mut tampered = packet.clone();
            tampered[position] ^= 0x01;

            assert_eq!(
                receiver.unprotect(&mut tampered).unwrap_err(),
                ErrorType::AuthTagMismatch
            );
        }
    }

    #[test]
    fn test_replay_rejected() {
        let sender = context();
        let mut receiver = context();

        let mut packet = framed_packet();
        sender.protect(&mut packet).unwrap();

        let mut first = packet.clone();
        let mut second = packet.clone();

        assert!(receiver.unprotect(&mut first).is_ok());
        assert_eq!(
            receiver.unprotect(&mut second).unwrap_err(),
            ErrorType::InvalidValue
        );
    }

    #[test]
    fn test_null_cipher_authenticates_only() {
        let sender = SrtcpContext::with_cipher(test_keys(), test_keys(), CipherKind::Null);
        let mut receiver = SrtcpContext::with_cipher(test_keys(), test_keys(), CipherKind::Null);

        let mut packet = framed_packet();
        sender.protect(&mut packet).unwrap();

        assert_eq!(
            &packet[RTCP_HEADER_SIZE..RTCP_HEADER_SIZE + PAYLOAD.len()],
            PAYLOAD
        );

        receiver.unprotect(&mut packet).unwrap();
    }

    #[test]
    fn test_handler_unprotects_rtcp() {
        let sender = context();
        let receiver = Arc::new(Mutex::new(context()));
        let mut handle = handler(receiver);

        let mut packet = framed_packet();
        sender.protect(&mut packet).unwrap();

        match handle(&packet, 3).unwrap() {
            PrimaryOutcome::Modified(frame) => {
                assert_eq!(&frame.payload[RTCP_HEADER_SIZE..], PAYLOAD);
                assert_eq!(frame.flags, 3);
            }
            outcome => panic!("Unexpected outcome {:?}", outcome),
        }
    }

    #[test]
    fn test_handler_ignores_rtp() {
        let context = Arc::new(Mutex::new(context()));
        let mut handle = handler(context);

        // Payload type 96 puts this outside the RTCP range.
        let mut packet = framed_packet();
        packet[1] = 96;

        assert_eq!(handle(&packet, 0).unwrap(), PrimaryOutcome::NotHandled);
    }

    #[test]
    fn test_short_packet_rejected() {
        let mut receiver = context();
        let mut short = vec![0u8; MIN_PACKET_SIZE - 1];

        assert_eq!(
            receiver.unprotect(&mut short).unwrap_err(),
            ErrorType::InvalidValue
        );
    }
}
