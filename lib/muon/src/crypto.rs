use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes128;
use ctr::Ctr128BE;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use subtle::ConstantTimeEq;

pub const AES_KEY_SIZE: usize = 16;
pub const SALT_SIZE: usize = 16;
pub const IV_SIZE: usize = 16;
pub const AUTH_TAG_SIZE: usize = 10;

type Aes128Ctr = Ctr128BE<Aes128>;
type HmacSha1 = Hmac<Sha1>;

/// Applies the AES-128 counter-mode keystream for `(key, iv)` to the buffer
/// in place. Counter mode is an involution, so the same call both encrypts
/// and decrypts.
#[inline]
pub fn ctr_apply(key: &[u8; AES_KEY_SIZE], iv: &[u8; IV_SIZE], buffer: &mut [u8]) {
    let mut cipher = Aes128Ctr::new(key.into(), iv.into());
    cipher.apply_keystream(buffer);
}

/// Computes the truncated HMAC-SHA1 authentication tag over `message`
/// followed by `suffix`.
#[inline]
pub fn auth_tag(key: &[u8; AES_KEY_SIZE], message: &[u8], suffix: &[u8]) -> [u8; AUTH_TAG_SIZE] {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts any key length");

    mac.update(message);
    mac.update(suffix);

    let digest = mac.finalize().into_bytes();

    let mut tag = [0u8; AUTH_TAG_SIZE];
    tag.copy_from_slice(&digest[..AUTH_TAG_SIZE]);
    tag
}

/// Constant-time comparison of two authentication tags.
#[inline]
pub fn tags_match(lhs: &[u8], rhs: &[u8]) -> bool {
    lhs.ct_eq(rhs).into()
}
