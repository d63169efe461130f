use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use sha2::{Digest, Sha256};

/// Derives a 256-bit AES key from the operator-configured
/// `REVENUE_PROVIDER_KEY_SECRET` via SHA-256 — an arbitrary-length secret
/// hashed down to a fixed-width key.
fn derive_key(secret: &str) -> [u8; 32] {
    let digest = Sha256::digest(secret.as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    key
}

/// Encrypts `plaintext` with AES-256-GCM, returning
/// `enc:<base64 iv>.<base64 tag>.<base64 ct>`.
pub fn encrypt_field(secret: &str, plaintext: &str) -> anyhow::Result<String> {
    let key = derive_key(secret);
    let cipher = Aes256Gcm::new_from_slice(&key)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|e| anyhow::anyhow!("encryption failed: {e}"))?;
    // AES-GCM appends a 16-byte tag to the ciphertext; split it back out so
    // the stored form names each part explicitly.
    let tag_start = ciphertext.len() - 16;
    let (ct, tag) = ciphertext.split_at(tag_start);
    Ok(format!(
        "enc:{}.{}.{}",
        base64::Engine::encode(&base64::engine::general_purpose::STANDARD, nonce),
        base64::Engine::encode(&base64::engine::general_purpose::STANDARD, tag),
        base64::Engine::encode(&base64::engine::general_purpose::STANDARD, ct),
    ))
}

pub fn decrypt_field(secret: &str, stored: &str) -> anyhow::Result<String> {
    let body = stored
        .strip_prefix("enc:")
        .ok_or_else(|| anyhow::anyhow!("not an encrypted field"))?;
    let mut parts = body.splitn(3, '.');
    let (iv_b64, tag_b64, ct_b64) = (
        parts.next().ok_or_else(|| anyhow::anyhow!("missing iv"))?,
        parts.next().ok_or_else(|| anyhow::anyhow!("missing tag"))?,
        parts.next().ok_or_else(|| anyhow::anyhow!("missing ciphertext"))?,
    );
    let engine = base64::engine::general_purpose::STANDARD;
    let iv = base64::Engine::decode(&engine, iv_b64)?;
    let tag = base64::Engine::decode(&engine, tag_b64)?;
    let ct = base64::Engine::decode(&engine, ct_b64)?;

    let key = derive_key(secret);
    let cipher = Aes256Gcm::new_from_slice(&key)?;
    let nonce = Nonce::from_slice(&iv);
    let mut combined = ct;
    combined.extend_from_slice(&tag);
    let plaintext = cipher
        .decrypt(nonce, combined.as_ref())
        .map_err(|e| anyhow::anyhow!("decryption failed: {e}"))?;
    Ok(String::from_utf8(plaintext)?)
}
