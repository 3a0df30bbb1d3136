//! Identity-token claim extraction (pure functions)

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use serde_json::Value;

/// Extract the `exp` claim (Unix seconds) from a signed identity token.
///
/// The token is `header.claims.signature`; the claims segment is base64url
/// encoded JSON. Any structural failure (fewer than two dots, undecodable
/// segment, non-JSON claims, missing or non-numeric `exp`) yields 0, which
/// callers treat as "expired, refresh immediately".
pub fn expiry_unix(token: &str) -> i64 {
    let mut segments = token.split('.');
    let (Some(_header), Some(claims), Some(_signature)) =
        (segments.next(), segments.next(), segments.next())
    else {
        return 0;
    };

    let Some(decoded) = decode_segment(claims) else {
        return 0;
    };
    let Ok(json) = serde_json::from_slice::<Value>(&decoded) else {
        return 0;
    };
    json.get("exp").and_then(Value::as_i64).unwrap_or(0)
}

/// Base64url-decode one token segment. Segments come unpadded; right-pad
/// with `=` to a multiple of four before handing off to the engine.
pub fn decode_segment(segment: &str) -> Option<Vec<u8>> {
    let mut padded = segment.to_string();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }
    URL_SAFE.decode(padded).ok()
}
