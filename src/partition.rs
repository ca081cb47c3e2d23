//! Partition key derivation.
//!
//! Every aggregate lives in the partition named by the tail of its identifier,
//! so a point operation only ever needs the identifier to be routed.

/// Number of trailing identifier characters that form the partition key.
pub const PARTITION_KEY_LENGTH: usize = 4;

/// Document path the containers are partitioned on.
pub const PARTITION_KEY_PATH: &str = "/partitionKey";

/// Returns the last [`PARTITION_KEY_LENGTH`] characters of the trimmed id, or an
/// empty string when the trimmed id is not longer than that.
///
/// Characters are counted as Unicode scalar values; no locale rules apply.
pub fn derive(id: &str) -> String {
    let trimmed = id.trim();
    let count = trimmed.chars().count();
    if count <= PARTITION_KEY_LENGTH {
        return String::new();
    }
    trimmed.chars().skip(count - PARTITION_KEY_LENGTH).collect()
}

pub fn derive_opt(id: Option<&str>) -> String {
    id.map(derive).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn takes_last_four_characters() {
        assert_eq!(derive("abcd1234"), "1234");
        assert_eq!(derive("user-0001"), "0001");
        assert_eq!(derive("abcde"), "bcde");
    }

    #[test]
    fn short_or_blank_ids_have_no_partition() {
        assert_eq!(derive("ab"), "");
        assert_eq!(derive("abcd"), "");
        assert_eq!(derive(""), "");
        assert_eq!(derive("      "), "");
        assert_eq!(derive_opt(None), "");
    }

    #[test]
    fn trims_before_deriving() {
        assert_eq!(derive("  abcd1234  "), "1234");
        assert_eq!(derive("  abcd  "), "");
    }

    #[test]
    fn counts_characters_not_bytes() {
        assert_eq!(derive("grüße-äöüß"), "äöüß");
        assert_eq!(derive("ıİıİ"), "");
    }

    #[test]
    fn is_deterministic() {
        let id = uuid::Uuid::new_v4().to_string();
        assert_eq!(derive(&id), derive(&id));
        assert_eq!(derive(&id).chars().count(), PARTITION_KEY_LENGTH);
        assert!(id.ends_with(&derive(&id)));
    }
}
