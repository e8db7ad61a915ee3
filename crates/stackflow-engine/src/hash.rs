//! Content hash of declared props
//!
//! Keys are written in sorted order and secrets are replaced by their keyed
//! fingerprint, so the hash is stable across runs and never depends on a
//! secret's plaintext directly.

use crate::error::Result;
use serde_json::Value;
use sha2::{Digest, Sha256};
use stackflow_state::SecretCodec;

pub fn input_hash(props: &Value, codec: &SecretCodec) -> Result<String> {
    let fingerprinted = codec.fingerprint_secrets(props)?;
    let mut canonical = String::new();
    write_canonical(&fingerprinted, &mut canonical)?;
    Ok(hex::encode(Sha256::digest(canonical.as_bytes())))
}

fn write_canonical(value: &Value, out: &mut String) -> Result<()> {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let key_json =
                    serde_json::to_string(key).map_err(stackflow_state::StateError::from)?;
                out.push_str(&key_json);
                out.push(':');
                write_canonical(&map[key], out)?;
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
    Ok(())
}
