const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const ENCODED_LENGTH: usize = 22;

pub const SANDBOX_PREFIX: &str = "sb_";
pub const NODE_PREFIX: &str = "node_";

/// Generate a UUIDv7 as raw 16 bytes.
pub fn generate_uuidv7() -> [u8; 16] {
    *uuid::Uuid::now_v7().as_bytes()
}

/// Encode 16 bytes as a fixed-length 22-character base62 string.
pub fn base62_encode(bytes: &[u8; 16]) -> String {
    let mut num = u128::from_be_bytes(*bytes);
    let mut chars = [b'0'; ENCODED_LENGTH];

    for i in (0..ENCODED_LENGTH).rev() {
        chars[i] = ALPHABET[(num % 62) as usize];
        num /= 62;
    }

    String::from_utf8(chars.to_vec()).unwrap()
}

/// Decode a 22-character base62 string back to 16 bytes.
pub fn base62_decode(s: &str) -> Result<[u8; 16], String> {
    if s.len() != ENCODED_LENGTH {
        return Err(format!(
            "Expected {} characters, got {}",
            ENCODED_LENGTH,
            s.len()
        ));
    }

    let mut num: u128 = 0;
    for c in s.bytes() {
        let idx = match c {
            b'0'..=b'9' => c - b'0',
            b'A'..=b'Z' => c - b'A' + 10,
            b'a'..=b'z' => c - b'a' + 36,
            _ => return Err(format!("Invalid base62 character: {}", c as char)),
        };
        num = num * 62 + idx as u128;
    }

    Ok(num.to_be_bytes())
}

/// Generate a prefixed ID: `{prefix}{base62(uuidv7)}`
pub fn generate_id(prefix: &str) -> String {
    bytes_to_id(prefix, &generate_uuidv7())
}

/// Parse a prefixed ID back to its prefix and raw bytes.
pub fn parse_id(id: &str) -> Result<(String, [u8; 16]), String> {
    let idx = id.rfind('_').ok_or("Invalid ID format: missing prefix separator")?;
    let prefix = &id[..=idx];
    let encoded = &id[idx + 1..];
    let bytes = base62_decode(encoded)?;
    Ok((prefix.to_string(), bytes))
}

/// Strip prefix and decode to raw 16 bytes.
pub fn id_to_bytes(id: &str) -> Result<[u8; 16], String> {
    parse_id(id).map(|(_, bytes)| bytes)
}

/// Encode raw bytes to a prefixed ID.
pub fn bytes_to_id(prefix: &str, bytes: &[u8; 16]) -> String {
    format!("{}{}", prefix, base62_encode(bytes))
}
