use std::fs::File;
use std::io::Write;
use std::path::Path;

use anyhow::Context;

/// Parses a 20-byte account address from a hex string.
///
/// Accepts the address with or without the "0x" prefix, in any letter case.
///
/// # Errors
/// Returns an error if the address is not 40 hex characters, contains invalid
/// hex, or is the zero address.
pub fn parse_address(addr_str: &str) -> anyhow::Result<[u8; 20]> {
    let trimmed = addr_str.trim();
    let cleaned = strip_hex_prefix(trimmed);
    if cleaned.len() != 40 {
        anyhow::bail!(
            "Invalid address length: expected 40 hex chars, got {}",
            cleaned.len()
        );
    }
    let mut address = [0u8; 20];
    hex::decode_to_slice(cleaned, &mut address)
        .map_err(|e| anyhow::anyhow!("Invalid hex encoding: {}", e))?;
    if address == [0u8; 20] {
        anyhow::bail!("Zero address not allowed");
    }
    Ok(address)
}

/// Parses a 32-byte hash (Merkle root, proof node, transaction hash) from hex.
pub fn parse_hash32(value: &str) -> anyhow::Result<[u8; 32]> {
    let cleaned = strip_hex_prefix(value.trim());
    if cleaned.len() != 64 {
        anyhow::bail!(
            "Invalid hash length: expected 64 hex chars, got {}",
            cleaned.len()
        );
    }
    let mut hash = [0u8; 32];
    hex::decode_to_slice(cleaned, &mut hash)
        .map_err(|e| anyhow::anyhow!("Invalid hex encoding: {}", e))?;
    Ok(hash)
}

/// Parses a published Merkle root. The all-zero digest is never a valid root.
pub fn validate_merkle_root(value: &str) -> anyhow::Result<[u8; 32]> {
    let root = parse_hash32(value)?;
    if root == [0u8; 32] {
        anyhow::bail!("Zero Merkle root not allowed");
    }
    Ok(root)
}

/// Lower-case, `0x`-prefixed hex rendering.
pub fn hex_encode(bytes: impl AsRef<[u8]>) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Writes `contents` to a sibling temp file and renames it over `path`, so
/// readers never observe a partially written file.
pub fn write_file_atomic(path: &Path, contents: &str) -> anyhow::Result<()> {
    let temp_path = path.with_extension("tmp");
    let mut file = File::create(&temp_path).context("Failed to create temp file")?;
    file.write_all(contents.as_bytes())
        .context("Failed to write to temp file")?;
    file.sync_all().context("Failed to flush temp file")?;
    std::fs::rename(&temp_path, path).context("Failed to move temp file to output")?;
    Ok(())
}

fn strip_hex_prefix(value: &str) -> &str {
    value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address_with_prefix() {
        let addr = "0x1234567890abcdef1234567890abcdef12345678";
        let result = parse_address(addr).unwrap();
        assert_eq!(result[0], 0x12);
        assert_eq!(result[19], 0x78);
    }

    #[test]
    fn test_parse_address_without_prefix_and_mixed_case() {
        let lower = parse_address("1234567890abcdef1234567890abcdef12345678").unwrap();
        let upper = parse_address(" 0X1234567890ABCDEF1234567890ABCDEF12345678 ").unwrap();
        assert_eq!(lower, upper);
    }

    #[test]
    fn test_parse_address_invalid_length() {
        assert!(parse_address("0x1234").is_err());
    }

    #[test]
    fn test_parse_address_invalid_hex() {
        assert!(parse_address("0xghijklmnopqrstuvwxyz1234567890abcdef1234").is_err());
    }

    #[test]
    fn test_parse_address_rejects_zero() {
        assert!(parse_address("0x0000000000000000000000000000000000000000").is_err());
    }

    #[test]
    fn test_validate_merkle_root() {
        let root = validate_merkle_root(&format!("0x{}", "ab".repeat(32))).unwrap();
        assert_eq!(root, [0xab; 32]);
        assert!(validate_merkle_root(&"00".repeat(32)).is_err());
        assert!(validate_merkle_root("0xabcd").is_err());
    }

    #[test]
    fn test_hex_encode() {
        assert_eq!(hex_encode([0xde, 0xad]), "0xdead");
    }

    #[test]
    fn test_write_file_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        write_file_atomic(&path, "first").unwrap();
        write_file_atomic(&path, "second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        assert!(!path.with_extension("tmp").exists());
    }
}
