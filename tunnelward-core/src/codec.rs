//! Worker payload codec
//!
//! Payloads travel in an environment variable, so the JSON form is wrapped in
//! URL-safe unpadded base64: no control characters and no `=`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tunnelward_common::{Result, TunnelError};

pub fn encode<T: Serialize>(value: &T) -> Result<String> {
    let json = serde_json::to_vec(value)
        .map_err(|e| TunnelError::Config(format!("cannot encode payload: {e}")))?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

pub fn decode<T: DeserializeOwned>(encoded: &str) -> Result<T> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded.trim())
        .map_err(|e| TunnelError::Decode(format!("invalid base64: {e}")))?;
    let text =
        std::str::from_utf8(&bytes).map_err(|e| TunnelError::Decode(format!("invalid utf-8: {e}")))?;
    serde_json::from_str(text).map_err(|e| TunnelError::Decode(format!("invalid payload: {e}")))
}
