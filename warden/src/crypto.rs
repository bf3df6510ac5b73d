use std::ffi::OsString;
use std::path::Path;
use std::time::Duration;

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::alphabet;
use base64::engine::general_purpose::GeneralPurpose;
use base64::engine::{DecodePaddingMode, GeneralPurposeConfig};
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha384, Sha512};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::access::{AccessStanza, HmacKind};
use crate::classify::{B64_GPG_PREFIX, B64_RIJNDAEL_SALT, MIN_GPG_MSG_SIZE};
use crate::cmd;
use crate::error::SpaError;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Wire base64: standard alphabet, no padding emitted, padding tolerated on
/// decode. Everything that crosses the UDP socket uses this engine.
pub const B64_WIRE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

const SALT_MAGIC: &[u8] = b"Salted__";
const SALT_LEN: usize = 8;
const AES_BLOCK: usize = 16;
/// Ceiling on a single external GPG invocation.
const GPG_TIMEOUT: Duration = Duration::from_secs(5);

/// Unpadded base64 length of `n` raw bytes.
pub const fn b64_no_pad_len(n: usize) -> usize {
    (n * 4 + 2) / 3
}

/// Client identifier as it appears on the wire: 4 LE bytes, 6 characters.
pub fn encode_client_id(id: u32) -> String {
    B64_WIRE.encode(id.to_le_bytes())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionType {
    RijndaelSymmetric,
    AsymmetricSigned,
}

/// Both cipher prefixes are stripped before transmission, so the ciphertext
/// itself is anonymous; size is what tells the two schemes apart.
pub fn encryption_type(enc_data: &[u8]) -> EncryptionType {
    if enc_data.len() > MIN_GPG_MSG_SIZE {
        EncryptionType::AsymmetricSigned
    } else {
        EncryptionType::RijndaelSymmetric
    }
}

fn hmac_bytes(kind: HmacKind, key: &[u8], data: &[u8]) -> Vec<u8> {
    match kind {
        HmacKind::Sha256 => {
            let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).expect("hmac key");
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
        HmacKind::Sha384 => {
            let mut mac = <Hmac<Sha384> as Mac>::new_from_slice(key).expect("hmac key");
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
        HmacKind::Sha512 => {
            let mut mac = <Hmac<Sha512> as Mac>::new_from_slice(key).expect("hmac key");
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
    }
}

/// Split `enc_and_tag` into ciphertext and trailing HMAC and verify the tag
/// over the encoded bytes exactly as transmitted. Runs before any plaintext
/// exists; failure reveals nothing beyond "failed".
fn split_verify_hmac<'a>(
    enc_and_tag: &'a [u8],
    hmac_key: &[u8],
    kind: HmacKind,
) -> Result<&'a [u8], SpaError> {
    let tag_len = b64_no_pad_len(kind.digest_len());
    if enc_and_tag.len() <= tag_len {
        return Err(SpaError::DecryptFailed);
    }
    let (enc, tag) = enc_and_tag.split_at(enc_and_tag.len() - tag_len);
    let expected = B64_WIRE.encode(hmac_bytes(kind, hmac_key, enc));
    if !bool::from(expected.as_bytes().ct_eq(tag)) {
        return Err(SpaError::DecryptFailed);
    }
    Ok(enc)
}

/// OpenSSL EVP_BytesToKey construction over SHA-256, one round: 32-byte key
/// plus 16-byte IV from passphrase and salt.
fn derive_key_iv(key: &[u8], salt: &[u8]) -> (Zeroizing<[u8; 32]>, [u8; 16]) {
    let mut h = Sha256::new();
    h.update(key);
    h.update(salt);
    let d1: [u8; 32] = h.finalize().into();
    let d1 = Zeroizing::new(d1);

    let mut h = Sha256::new();
    h.update(d1.as_slice());
    h.update(key);
    h.update(salt);
    let d2: [u8; 32] = h.finalize().into();
    let d2 = Zeroizing::new(d2);

    let mut iv = [0u8; 16];
    iv.copy_from_slice(&d2[..16]);
    (d1, iv)
}

/// Decrypt a symmetric SPA payload (client-ID prefix already removed). The
/// HMAC is verified before any decryption work; every failure collapses into
/// the same generic error.
pub fn decrypt_symmetric(
    enc_and_tag: &[u8],
    key: &[u8],
    hmac_key: &[u8],
    hmac_type: HmacKind,
) -> Result<Zeroizing<String>, SpaError> {
    let enc = split_verify_hmac(enc_and_tag, hmac_key, hmac_type)?;

    let mut full = Vec::with_capacity(B64_RIJNDAEL_SALT.len() + enc.len());
    full.extend_from_slice(B64_RIJNDAEL_SALT);
    full.extend_from_slice(enc);
    let raw = B64_WIRE.decode(&full).map_err(|_| SpaError::DecryptFailed)?;

    if raw.len() < SALT_MAGIC.len() + SALT_LEN + AES_BLOCK
        || !raw.starts_with(SALT_MAGIC)
    {
        return Err(SpaError::DecryptFailed);
    }
    let salt = &raw[SALT_MAGIC.len()..SALT_MAGIC.len() + SALT_LEN];
    let ct = &raw[SALT_MAGIC.len() + SALT_LEN..];
    if ct.len() % AES_BLOCK != 0 {
        return Err(SpaError::DecryptFailed);
    }

    let (aes_key, iv) = derive_key_iv(key, salt);
    let dec = Aes256CbcDec::new_from_slices(aes_key.as_slice(), &iv)
        .map_err(|_| SpaError::DecryptFailed)?;
    let pt = Zeroizing::new(
        dec.decrypt_padded_vec_mut::<Pkcs7>(ct)
            .map_err(|_| SpaError::DecryptFailed)?,
    );

    let text = std::str::from_utf8(&pt).map_err(|_| SpaError::DecryptFailed)?;
    Ok(Zeroizing::new(text.to_string()))
}

/// Encrypt a plaintext SPA message the way the client does: salt, CBC, prefix
/// strip, trailing HMAC over the encoded bytes. Shared with the knock client
/// and the tests.
pub fn encrypt_symmetric(
    plaintext: &str,
    key: &[u8],
    hmac_key: &[u8],
    hmac_type: HmacKind,
) -> Result<String, SpaError> {
    let mut salt = [0u8; SALT_LEN];
    getrandom::getrandom(&mut salt).map_err(|_| SpaError::CryptoContext)?;

    let (aes_key, iv) = derive_key_iv(key, &salt);
    let enc = Aes256CbcEnc::new_from_slices(aes_key.as_slice(), &iv)
        .map_err(|_| SpaError::CryptoContext)?;
    let ct = enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

    let mut raw = Vec::with_capacity(SALT_MAGIC.len() + SALT_LEN + ct.len());
    raw.extend_from_slice(SALT_MAGIC);
    raw.extend_from_slice(&salt);
    raw.extend_from_slice(&ct);

    let mut encoded = B64_WIRE.encode(&raw);
    debug_assert!(encoded.as_bytes().starts_with(B64_RIJNDAEL_SALT));
    let stripped: String = encoded.split_off(B64_RIJNDAEL_SALT.len());

    let tag = B64_WIRE.encode(hmac_bytes(hmac_type, hmac_key, stripped.as_bytes()));
    Ok(stripped + &tag)
}

/// Full wire packet, client-ID prefix included when nonzero.
pub fn encode_spa_packet(
    plaintext: &str,
    client_id: u32,
    key: &[u8],
    hmac_key: &[u8],
    hmac_type: HmacKind,
) -> Result<String, SpaError> {
    let body = encrypt_symmetric(plaintext, key, hmac_key, hmac_type)?;
    if client_id != 0 {
        Ok(encode_client_id(client_id) + &body)
    } else {
        Ok(body)
    }
}

/// Wrap a binary GPG message for the wire: encode, strip the "hQ" prefix,
/// append the HMAC trailer.
pub fn encode_asymmetric_body(
    gpg_msg: &[u8],
    hmac_key: &[u8],
    hmac_type: HmacKind,
) -> Result<String, SpaError> {
    let mut encoded = B64_WIRE.encode(gpg_msg);
    if !encoded.as_bytes().starts_with(B64_GPG_PREFIX) {
        return Err(SpaError::CryptoContext);
    }
    let stripped: String = encoded.split_off(B64_GPG_PREFIX.len());
    let tag = B64_WIRE.encode(hmac_bytes(hmac_type, hmac_key, stripped.as_bytes()));
    Ok(stripped + &tag)
}

/// Signature facts pulled from the GPG status stream after a successful
/// decryption.
#[derive(Debug, Default)]
pub struct GpgVerdict {
    pub signer_id: Option<String>,
    pub signer_fpr: Option<String>,
    pub sig_ok: bool,
}

pub struct AsymOutcome {
    pub plaintext: Zeroizing<String>,
    pub verdict: GpgVerdict,
}

fn parse_gpg_status(stderr: &[u8]) -> GpgVerdict {
    let mut v = GpgVerdict::default();
    for line in String::from_utf8_lossy(stderr).lines() {
        let Some(rest) = line.strip_prefix("[GNUPG:] ") else {
            continue;
        };
        let mut words = rest.split_whitespace();
        match words.next() {
            Some("GOODSIG") => {
                v.sig_ok = true;
                v.signer_id = words.next().map(str::to_string);
            }
            Some("VALIDSIG") => {
                v.signer_fpr = words.next().map(str::to_string);
            }
            Some("BADSIG") | Some("ERRSIG") => {
                v.sig_ok = false;
            }
            _ => {}
        }
    }
    v
}

/// Decrypt an asymmetric SPA payload by handing the reassembled GPG message
/// to the stanza's GPG executable. HMAC still comes first; the decrypted
/// output and any signer facts come back together.
pub fn decrypt_asymmetric(
    enc_and_tag: &[u8],
    acc: &AccessStanza,
) -> Result<AsymOutcome, SpaError> {
    let hmac_key = acc.hmac_key.as_ref().ok_or(SpaError::CryptoContext)?;
    let enc = split_verify_hmac(enc_and_tag, hmac_key.as_bytes(), acc.hmac_type)?;

    let mut full = Vec::with_capacity(B64_GPG_PREFIX.len() + enc.len());
    full.extend_from_slice(B64_GPG_PREFIX);
    full.extend_from_slice(enc);
    let msg = B64_WIRE.decode(&full).map_err(|_| SpaError::DecryptFailed)?;

    let home = acc.gpg_home_dir.as_ref().ok_or(SpaError::CryptoContext)?;
    let exe: &Path = acc.gpg_exe.as_deref().unwrap_or(Path::new("gpg"));

    let mut args: Vec<OsString> = vec![
        "--batch".into(),
        "--no-tty".into(),
        "--quiet".into(),
        "--status-fd".into(),
        "2".into(),
        "--homedir".into(),
        home.into(),
    ];
    if let Some(pw) = &acc.gpg_decrypt_pw {
        args.push("--pinentry-mode".into());
        args.push("loopback".into());
        args.push("--passphrase".into());
        args.push(pw.into());
    }
    args.push("--decrypt".into());

    let out = cmd::run_argv(exe, &args, Some(&msg), Some(GPG_TIMEOUT))
        .map_err(|_| SpaError::DecryptFailed)?;
    if out.status != Some(0) {
        return Err(SpaError::DecryptFailed);
    }

    let verdict = parse_gpg_status(&out.stderr);
    if acc.gpg_require_sig && !verdict.sig_ok && !acc.gpg_ignore_sig_error {
        return Err(SpaError::DecryptFailed);
    }

    let stdout = Zeroizing::new(out.stdout);
    let text = std::str::from_utf8(&stdout).map_err(|_| SpaError::DecryptFailed)?;
    Ok(AsymOutcome {
        plaintext: Zeroizing::new(text.to_string()),
        verdict,
    })
}
