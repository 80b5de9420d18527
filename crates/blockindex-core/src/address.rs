//! Sender address derivation.

use sha2::{Digest, Sha256};

use crate::error::IndexerError;

/// Length in bytes of a derived address.
pub const ADDRESS_LENGTH: usize = 20;

/// Derive the address of a hex encoded public key: the first 20 bytes of
/// its SHA-256 digest, hex encoded.
pub fn address_from_public_key(public_key: &str) -> Result<String, IndexerError> {
    let key = public_key.strip_prefix("0x").unwrap_or(public_key);
    let bytes = hex::decode(key)
        .map_err(|e| IndexerError::invalid(format!("malformed public key {public_key:?}: {e}")))?;
    if bytes.is_empty() {
        return Err(IndexerError::invalid("empty public key"));
    }
    let digest = Sha256::digest(&bytes);
    Ok(hex::encode(&digest[..ADDRESS_LENGTH]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_truncated_digest() {
        // sha256("") is e3b0c442...; sha256 of 0x00 is 6e340b9c...
        let address = address_from_public_key("00").unwrap();
        assert_eq!(address, "6e340b9cffb37a989ca544e6bb780a2c78901d3f");
        assert_eq!(address.len(), ADDRESS_LENGTH * 2);
    }

    #[test]
    fn accepts_0x_prefix() {
        assert_eq!(
            address_from_public_key("0x00").unwrap(),
            address_from_public_key("00").unwrap()
        );
    }

    #[test]
    fn rejects_bad_keys() {
        assert!(matches!(
            address_from_public_key("zz"),
            Err(IndexerError::InvalidInput(_))
        ));
        assert!(address_from_public_key("").is_err());
    }
}
