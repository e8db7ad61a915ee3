//! Secret values and the codec that seals them for storage
//!
//! A secret travels through props and outputs as a tagged JSON object. The
//! plaintext may be any JSON value; once sealed it moves to its own tag:
//!
//! ```text
//! in memory:  {"@secret": <any JSON value>}
//! in state:   {"@sealed": {"scheme": "aes-256-gcm", "ciphertext": "...", "nonce": "..."}}
//! ```
//!
//! Only [`SecretCodec`] moves a value between the two forms. Any failure to
//! open an envelope is fatal; there is no fallback to plaintext.

use crate::error::{Result, StateError};
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;

pub const SECRET_TAG: &str = "@secret";
pub const SEALED_TAG: &str = "@sealed";
pub const SCHEME_AES_256_GCM: &str = "aes-256-gcm";

const NONCE_LEN: usize = 12;
const CIPHER_KEY_CONTEXT: &[u8] = b"stackflow/secret/aes-256-gcm/v1\0";
const MAC_KEY_CONTEXT: &[u8] = b"stackflow/secret/fingerprint/v1\0";

type HmacSha256 = Hmac<Sha256>;

/// A value the caller marked as sensitive
#[derive(Clone, PartialEq)]
pub struct Secret(Value);

impl Secret {
    pub fn new(plaintext: impl Into<Value>) -> Self {
        Self(plaintext.into())
    }

    pub fn expose(&self) -> &Value {
        &self.0
    }

    /// Plaintext of a string secret
    pub fn expose_str(&self) -> Option<&str> {
        self.0.as_str()
    }

    /// Read a plaintext secret marker
    pub fn from_value(value: &Value) -> Option<Self> {
        tagged(value, SECRET_TAG).map(|inner| Self(inner.clone()))
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

impl From<Secret> for Value {
    fn from(secret: Secret) -> Self {
        tag(SECRET_TAG, secret.0)
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        Value::from(self.clone()).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Secret::from_value(&value)
            .ok_or_else(|| serde::de::Error::custom("expected {\"@secret\": <value>}"))
    }
}

/// Encrypted form of a secret as persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub scheme: String,
    pub ciphertext: String,
    pub nonce: String,
}

/// Key material derived from the run's password
#[derive(Clone)]
pub struct SecretKey {
    cipher_key: [u8; 32],
    mac_key: [u8; 32],
}

impl SecretKey {
    pub fn from_password(password: &str) -> Self {
        Self {
            cipher_key: derive(CIPHER_KEY_CONTEXT, password),
            mac_key: derive(MAC_KEY_CONTEXT, password),
        }
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(***)")
    }
}

fn derive(context: &[u8], password: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(context);
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

/// Encrypt the JSON encoding of `plaintext`
pub fn encrypt(plaintext: &Value, key: &SecretKey) -> Result<Envelope> {
    let bytes = serde_json::to_vec(plaintext)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.cipher_key));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, bytes.as_slice())
        .map_err(|_| StateError::Decryption("encryption failed".to_string()))?;
    Ok(Envelope {
        scheme: SCHEME_AES_256_GCM.to_string(),
        ciphertext: STANDARD.encode(ciphertext),
        nonce: STANDARD.encode(nonce),
    })
}

pub fn decrypt(envelope: &Envelope, key: &SecretKey) -> Result<Value> {
    if envelope.scheme != SCHEME_AES_256_GCM {
        return Err(StateError::Decryption(format!(
            "unsupported scheme: {}",
            envelope.scheme
        )));
    }
    let nonce = STANDARD
        .decode(&envelope.nonce)
        .map_err(|e| StateError::Decryption(format!("malformed nonce: {}", e)))?;
    if nonce.len() != NONCE_LEN {
        return Err(StateError::Decryption(format!(
            "nonce must be {} bytes, got {}",
            NONCE_LEN,
            nonce.len()
        )));
    }
    let ciphertext = STANDARD
        .decode(&envelope.ciphertext)
        .map_err(|e| StateError::Decryption(format!("malformed ciphertext: {}", e)))?;

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.cipher_key));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
        .map_err(|_| StateError::Decryption("wrong key or corrupted envelope".to_string()))?;
    serde_json::from_slice(&plaintext)
        .map_err(|e| StateError::Decryption(format!("plaintext is not JSON: {}", e)))
}

/// A sealed value plus the JSON pointers of the secrets inside it
#[derive(Debug, Clone, PartialEq)]
pub struct Sealed {
    pub value: Value,
    pub secret_fields: Vec<String>,
}

/// Seals and opens secrets inside arbitrary JSON with the run's key
#[derive(Debug, Clone, Default)]
pub struct SecretCodec {
    key: Option<SecretKey>,
}

impl SecretCodec {
    pub fn new(key: Option<SecretKey>) -> Self {
        Self { key }
    }

    pub fn from_password(password: Option<&str>) -> Self {
        Self::new(password.map(SecretKey::from_password))
    }

    fn key(&self) -> Result<&SecretKey> {
        self.key
            .as_ref()
            .ok_or_else(|| StateError::Decryption("no key material configured".to_string()))
    }

    /// Replace every plaintext secret with a sealed envelope.
    ///
    /// Values that are already sealed are kept, after checking that they
    /// open with this codec's key.
    pub fn seal(&self, value: &Value) -> Result<Sealed> {
        let mut secret_fields = Vec::new();
        let value = self.seal_at(value, String::new(), &mut secret_fields)?;
        Ok(Sealed {
            value,
            secret_fields,
        })
    }

    fn seal_at(&self, value: &Value, pointer: String, fields: &mut Vec<String>) -> Result<Value> {
        if let Some(plaintext) = tagged(value, SECRET_TAG) {
            let envelope = encrypt(plaintext, self.key()?)?;
            fields.push(pointer);
            return Ok(sealed_value(&envelope));
        }
        if let Some(inner) = tagged(value, SEALED_TAG) {
            let envelope = parse_envelope(inner, &pointer)
                .map_err(|e| StateError::InvalidSecret(e.to_string()))?;
            decrypt(&envelope, self.key()?)?;
            fields.push(pointer);
            return Ok(value.clone());
        }
        walk(value, pointer, |child, ptr| self.seal_at(child, ptr, fields))
    }

    /// Replace every sealed envelope with its plaintext secret
    pub fn unseal(&self, value: &Value) -> Result<Value> {
        self.unseal_at(value, String::new())
    }

    fn unseal_at(&self, value: &Value, pointer: String) -> Result<Value> {
        if let Some(inner) = tagged(value, SEALED_TAG) {
            let envelope = parse_envelope(inner, &pointer)?;
            let plaintext = decrypt(&envelope, self.key()?)?;
            return Ok(Secret::new(plaintext).into());
        }
        if tagged(value, SECRET_TAG).is_some() {
            return Ok(value.clone());
        }
        walk(value, pointer, |child, ptr| self.unseal_at(child, ptr))
    }

    /// Keyed digest of a secret value, stable across runs for the same key
    pub fn fingerprint(&self, plaintext: &Value) -> Result<String> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.key()?.mac_key)
            .map_err(|e| StateError::Decryption(e.to_string()))?;
        mac.update(&serde_json::to_vec(plaintext)?);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Replace every secret (plaintext or sealed) with its fingerprint
    pub fn fingerprint_secrets(&self, value: &Value) -> Result<Value> {
        self.fingerprint_at(value, String::new())
    }

    fn fingerprint_at(&self, value: &Value, pointer: String) -> Result<Value> {
        let plaintext = if let Some(plaintext) = tagged(value, SECRET_TAG) {
            plaintext.clone()
        } else if let Some(inner) = tagged(value, SEALED_TAG) {
            let envelope = parse_envelope(inner, &pointer)
                .map_err(|e| StateError::InvalidSecret(e.to_string()))?;
            decrypt(&envelope, self.key()?)?
        } else {
            return walk(value, pointer, |child, ptr| self.fingerprint_at(child, ptr));
        };
        Ok(tag(
            SECRET_TAG,
            Value::String(format!("hmac-sha256:{}", self.fingerprint(&plaintext)?)),
        ))
    }
}

/// Inner value of a single-key object tagged with `tag`
fn tagged<'a>(value: &'a Value, tag: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) if map.len() == 1 => map.get(tag),
        _ => None,
    }
}

fn tag(tag: &str, inner: Value) -> Value {
    let mut map = Map::new();
    map.insert(tag.to_string(), inner);
    Value::Object(map)
}

fn parse_envelope(inner: &Value, pointer: &str) -> Result<Envelope> {
    serde_json::from_value(inner.clone()).map_err(|e| {
        StateError::Decryption(format!(
            "malformed envelope at {}: {}",
            display_pointer(pointer),
            e
        ))
    })
}

fn sealed_value(envelope: &Envelope) -> Value {
    tag(
        SEALED_TAG,
        serde_json::json!({
            "scheme": envelope.scheme,
            "ciphertext": envelope.ciphertext,
            "nonce": envelope.nonce,
        }),
    )
}

/// Rebuild objects and arrays, mapping each child with its JSON pointer
fn walk<F>(value: &Value, pointer: String, mut f: F) -> Result<Value>
where
    F: FnMut(&Value, String) -> Result<Value>,
{
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                let child = format!("{}/{}", pointer, k.replace('~', "~0").replace('/', "~1"));
                out.insert(k.clone(), f(v, child)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, v)| f(v, format!("{}/{}", pointer, i)))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        other => Ok(other.clone()),
    }
}

fn display_pointer(pointer: &str) -> &str {
    if pointer.is_empty() { "/" } else { pointer }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn codec(password: &str) -> SecretCodec {
        SecretCodec::from_password(Some(password))
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = SecretKey::from_password("correct horse");
        for plaintext in [json!(""), json!("token"), json!("日本語のシークレット")] {
            let envelope = encrypt(&plaintext, &key).unwrap();
            assert_eq!(envelope.scheme, SCHEME_AES_256_GCM);
            assert_eq!(decrypt(&envelope, &key).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_non_string_secrets_roundtrip() {
        let codec = codec("pw");
        for plaintext in [
            json!(42),
            json!(-1.5),
            json!(true),
            json!(null),
            json!(["a", "b"]),
            json!({"user": "admin", "port": 5432}),
            json!({"scheme": "not-an-envelope", "ciphertext": "x", "nonce": "y"}),
        ] {
            let props = json!({"value": Secret::new(plaintext.clone())});
            let sealed = codec.seal(&props).unwrap();
            assert_eq!(sealed.secret_fields, vec!["/value"]);
            assert!(sealed.value["value"][SECRET_TAG].is_null());
            assert_eq!(sealed.value["value"][SEALED_TAG]["scheme"], SCHEME_AES_256_GCM);

            let opened = codec.unseal(&sealed.value).unwrap();
            assert_eq!(opened, props);
            let secret = Secret::from_value(&opened["value"]).unwrap();
            assert_eq!(secret.expose(), &plaintext);
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        let envelope = encrypt(&json!("token"), &SecretKey::from_password("k1")).unwrap();
        let result = decrypt(&envelope, &SecretKey::from_password("k2"));
        assert!(matches!(result, Err(StateError::Decryption(_))));
    }

    #[test]
    fn test_malformed_envelope_fails() {
        let key = SecretKey::from_password("k");
        let token = json!("token");
        let mut envelope = encrypt(&token, &key).unwrap();
        envelope.nonce = STANDARD.encode([0u8; 4]);
        assert!(matches!(decrypt(&envelope, &key), Err(StateError::Decryption(_))));

        let mut envelope = encrypt(&token, &key).unwrap();
        envelope.scheme = "rot13".to_string();
        assert!(matches!(decrypt(&envelope, &key), Err(StateError::Decryption(_))));

        let mut envelope = encrypt(&token, &key).unwrap();
        envelope.ciphertext = "!!!".to_string();
        assert!(matches!(decrypt(&envelope, &key), Err(StateError::Decryption(_))));
    }

    #[test]
    fn test_malformed_sealed_marker_in_input_is_invalid() {
        let codec = codec("pw");
        let props = json!({"password": {"@sealed": "not an envelope"}});
        assert!(matches!(codec.seal(&props), Err(StateError::InvalidSecret(_))));
        assert!(matches!(
            codec.fingerprint_secrets(&props),
            Err(StateError::InvalidSecret(_))
        ));

        // 保存済みレコード側の壊れたエンベロープは復号エラー
        assert!(matches!(codec.unseal(&props), Err(StateError::Decryption(_))));
    }

    #[test]
    fn test_seal_nested_secrets() {
        let codec = codec("pw");
        let props = json!({
            "name": "db",
            "credentials": {"password": Secret::new("s3cr3t")},
            "tokens": [Secret::new("a"), "plain"],
        });

        let sealed = codec.seal(&props).unwrap();
        let text = sealed.value.to_string();
        assert!(!text.contains("s3cr3t"));
        assert_eq!(sealed.value["name"], "db");
        assert_eq!(sealed.value["tokens"][1], "plain");
        assert_eq!(
            sealed.value["credentials"]["password"][SEALED_TAG]["scheme"],
            SCHEME_AES_256_GCM
        );
        assert_eq!(sealed.secret_fields, vec!["/credentials/password", "/tokens/0"]);

        assert_eq!(codec.unseal(&sealed.value).unwrap(), props);
    }

    #[test]
    fn test_sealing_twice_keeps_envelope() {
        let codec = codec("pw");
        let sealed = codec.seal(&json!({"p": Secret::new(7)})).unwrap();
        let again = codec.seal(&sealed.value).unwrap();
        assert_eq!(again.value, sealed.value);
        assert_eq!(again.secret_fields, vec!["/p"]);
    }

    #[test]
    fn test_seal_without_key_fails_closed() {
        let codec = SecretCodec::default();
        let props = json!({"password": Secret::new("x")});
        assert!(matches!(codec.seal(&props), Err(StateError::Decryption(_))));

        // シークレットが無ければ鍵は不要
        let plain = json!({"fifo": true});
        assert_eq!(codec.seal(&plain).unwrap().value, plain);
    }

    #[test]
    fn test_unseal_with_wrong_key_fails() {
        let sealed = codec("k1").seal(&json!({"p": Secret::new("x")})).unwrap();
        assert!(matches!(
            codec("k2").unseal(&sealed.value),
            Err(StateError::Decryption(_))
        ));
    }

    #[test]
    fn test_fingerprint_is_stable_and_keyed() {
        let a = codec("k1");
        let props = json!({"password": Secret::new("x"), "limits": Secret::new(json!([1, 2]))});
        let sealed = a.seal(&props).unwrap();

        let fp_plain = a.fingerprint_secrets(&props).unwrap();
        let fp_sealed = a.fingerprint_secrets(&sealed.value).unwrap();
        assert_eq!(fp_plain, fp_sealed);
        assert!(!fp_plain.to_string().contains("\"x\""));

        // 型が違えば別の指紋
        let as_number = a.fingerprint_secrets(&json!({"n": Secret::new(1)})).unwrap();
        let as_string = a.fingerprint_secrets(&json!({"n": Secret::new("1")})).unwrap();
        assert_ne!(as_number, as_string);

        let b = codec("k2");
        assert_ne!(b.fingerprint_secrets(&props).unwrap(), fp_plain);
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{:?}", secret), "Secret(***)");
        assert_eq!(secret.to_string(), "***");
        assert!(!format!("{:?}", SecretKey::from_password("hunter2")).contains("hunter2"));
    }

    #[test]
    fn test_secret_serde() {
        let value = serde_json::to_value(Secret::new("x")).unwrap();
        assert_eq!(value, json!({"@secret": "x"}));
        let back: Secret = serde_json::from_value(value).unwrap();
        assert_eq!(back.expose_str(), Some("x"));

        let back: Secret = serde_json::from_value(json!({"@secret": {"a": 1}})).unwrap();
        assert_eq!(back.expose(), &json!({"a": 1}));
        assert!(serde_json::from_value::<Secret>(json!({"@secret": 1, "b": 1})).is_err());
    }
}
