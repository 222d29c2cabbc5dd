/// Input validation for directory keys and values
///
/// BPNs follow the Catena-X layout (`BPN` + type letter + 12 upper-case
/// alphanumerics). DIDs are checked against the W3C DID syntax:
/// `did:<method-name>:<method-specific-id>`.
use crate::error::{BdrsError, BdrsResult};

/// Total length of a BPN
pub const BPN_LENGTH: usize = 16;

/// Upper bound for stored DIDs
pub const MAX_DID_LENGTH: usize = 2048;

/// Validate a Business Partner Number
pub fn validate_bpn(bpn: &str) -> BdrsResult<()> {
    if bpn.is_empty() {
        return Err(BdrsError::Validation("BPN cannot be empty".to_string()));
    }

    if bpn.len() != BPN_LENGTH {
        return Err(BdrsError::Validation(format!(
            "BPN must be {} characters, got {}",
            BPN_LENGTH,
            bpn.len()
        )));
    }

    let bytes = bpn.as_bytes();
    if &bytes[..3] != b"BPN" {
        return Err(BdrsError::Validation(format!(
            "BPN must start with 'BPN': {}",
            bpn
        )));
    }

    // Legal entity, site or address
    if !matches!(bytes[3], b'L' | b'S' | b'A') {
        return Err(BdrsError::Validation(format!(
            "Unknown BPN type '{}' in {}",
            bytes[3] as char, bpn
        )));
    }

    if !bytes[4..]
        .iter()
        .all(|b| b.is_ascii_digit() || b.is_ascii_uppercase())
    {
        return Err(BdrsError::Validation(format!(
            "BPN contains invalid characters: {}",
            bpn
        )));
    }

    Ok(())
}

/// Validate a DID against the DID syntax
///
/// Only bare DIDs are accepted; DID URLs (path, query or fragment) are not
/// directory values.
pub fn validate_did(did: &str) -> BdrsResult<()> {
    if did.is_empty() {
        return Err(BdrsError::Validation("DID cannot be empty".to_string()));
    }

    if did.len() > MAX_DID_LENGTH {
        return Err(BdrsError::Validation(format!(
            "DID too long (max {} characters)",
            MAX_DID_LENGTH
        )));
    }

    let rest = did
        .strip_prefix("did:")
        .ok_or_else(|| BdrsError::Validation(format!("DID must start with 'did:': {}", did)))?;

    let (method, specific_id) = rest.split_once(':').ok_or_else(|| {
        BdrsError::Validation(format!("DID is missing a method-specific id: {}", did))
    })?;

    if method.is_empty()
        || !method
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
    {
        return Err(BdrsError::Validation(format!(
            "Invalid DID method name '{}'",
            method
        )));
    }

    validate_method_specific_id(specific_id)
        .map_err(|reason| BdrsError::Validation(format!("Invalid DID {}: {}", did, reason)))
}

fn validate_method_specific_id(id: &str) -> Result<(), &'static str> {
    if id.is_empty() {
        return Err("method-specific id is empty");
    }
    if id.ends_with(':') {
        return Err("method-specific id must not end with ':'");
    }

    let bytes = id.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes.get(i + 1..i + 3).ok_or("truncated percent-encoding")?;
                if !hex.iter().all(u8::is_ascii_hexdigit) {
                    return Err("invalid percent-encoding");
                }
                i += 3;
            }
            b if b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_' | b':') => i += 1,
            b'/' | b'?' | b'#' => return Err("DID URLs are not accepted"),
            _ => return Err("invalid character"),
        }
    }

    Ok(())
}
