/// Compute CRC16 (XMODEM) hash over the provided bytes.
pub fn crc16(data: &[u8]) -> u16 {
    crc16::State::<crc16::XMODEM>::calculate(data)
}

/// Trim hash tags according to Redis Cluster specification.
pub fn trim_hash_tag<'a>(key: &'a [u8], hash_tag: Option<&[u8]>) -> &'a [u8] {
    let tag = match hash_tag {
        Some(tag) if tag.len() == 2 => tag,
        _ => return key,
    };

    let (start, end) = (tag[0], tag[1]);

    if let Some(begin) = key.iter().position(|&b| b == start) {
        if let Some(offset) = key[begin + 1..].iter().position(|&b| b == end) {
            if offset > 0 {
                let start_idx = begin + 1;
                return &key[start_idx..start_idx + offset];
            }
        }
    }
    key
}

/// Parse a signed decimal integer argument. Leading `+` and surrounding
/// whitespace are rejected the same way Redis rejects them.
pub fn parse_i64(raw: &[u8]) -> Option<i64> {
    if raw.is_empty() || raw.len() > 20 {
        return None;
    }
    std::str::from_utf8(raw).ok()?.parse::<i64>().ok().filter(|_| raw[0] != b'+')
}
