//! Identifier generation.

use rand::Rng;

/// Random 24-hex-char token used as a bus message id.
pub fn message_id() -> String {
    let bytes: [u8; 12] = rand::thread_rng().r#gen();
    hex::encode(bytes)
}

/// Fresh run id correlating one end-to-end reconciliation.
pub fn run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Server-assigned identity for stored objects.
pub fn object_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_is_24_hex_chars() {
        let id = message_id();
        assert_eq!(id.len(), 24);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn run_ids_parse_as_uuid() {
        let id = run_id();
        assert!(uuid::Uuid::parse_str(&id).is_ok());
        assert_ne!(id, run_id());
    }
}
