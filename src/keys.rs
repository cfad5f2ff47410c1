use md5::{Digest, Md5};

use crate::error::{KvError, Result};

/// Backend key for `tkey` at `transid` within `cd_id`.
///
/// Two revisions of the same logical key are distinct backend objects; the
/// transaction id is part of the name.
pub fn encode_key(cd_id: i64, tkey: &[u8], transid: i64) -> String {
    let hexkey = hex_simd::encode_to_string(tkey, hex_simd::AsciiCase::Lower);
    if cd_id == 0 {
        format!("{hexkey}_{transid}")
    } else {
        format!("cd{cd_id}_{hexkey}_{transid}")
    }
}

/// Inverse of [`encode_key`]. Used by the rebuild pass to map backend
/// listings back to metadata rows.
pub fn decode_key(key: &str) -> Result<(i64, Vec<u8>, i64)> {
    let (cd_id, rest) = match key.strip_prefix("cd") {
        Some(rest) => {
            let (cd, tail) = rest
                .split_once('_')
                .ok_or_else(|| KvError::Misuse(format!("malformed backend key {key}")))?;
            let cd_id: i64 = cd
                .parse()
                .map_err(|_| KvError::Misuse(format!("malformed tenant in backend key {key}")))?;
            (cd_id, tail)
        }
        None => (0, key),
    };

    let (hexkey, transid) = rest
        .rsplit_once('_')
        .ok_or_else(|| KvError::Misuse(format!("malformed backend key {key}")))?;
    let tkey = hex_simd::decode_to_vec(hexkey)
        .map_err(|_| KvError::Misuse(format!("malformed tkey in backend key {key}")))?;
    let transid: i64 = transid
        .parse()
        .map_err(|_| KvError::Misuse(format!("malformed transid in backend key {key}")))?;

    Ok((cd_id, tkey, transid))
}

/// Spreads keys across backend shards. The prefix is the first four hex
/// chars of the key's md5.
pub fn prefix_key(key: &str) -> String {
    let digest = Md5::digest(key.as_bytes());
    let hexd = hex_simd::encode_to_string(&digest[..2], hex_simd::AsciiCase::Lower);
    format!("{hexd}/{key}")
}

pub fn strip_prefix_key(key: &str) -> &str {
    match key.split_once('/') {
        Some((prefix, rest)) if prefix.len() == 4 => rest,
        _ => key,
    }
}

/// First 16 bytes of a stored `MD5Info` blob.
pub fn md5sum(md5_info: &[u8]) -> &[u8] {
    if md5_info.len() >= 16 {
        &md5_info[..16]
    } else {
        &[]
    }
}

/// Backend location info appended after the content hash, if any.
pub fn locinfo(md5_info: &[u8]) -> &[u8] {
    match md5_info.len() {
        16 => &[],
        n if n > 16 => &md5_info[16..],
        _ => md5_info,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_roundtrip() {
        let key = encode_key(0, b"some/logical key", 42);
        assert_eq!(decode_key(&key).unwrap(), (0, b"some/logical key".to_vec(), 42));

        let key = encode_key(7, b"\x00\xff", 3);
        assert_eq!(decode_key(&key).unwrap(), (7, vec![0u8, 0xff], 3));
    }

    #[test]
    fn prefix_is_stable_and_strippable() {
        let key = encode_key(0, b"a", 1);
        let prefixed = prefix_key(&key);
        assert_eq!(prefix_key(&key), prefixed);
        assert_eq!(strip_prefix_key(&prefixed), key);
    }

    #[test]
    fn md5_info_split() {
        let mut info = vec![0u8; 16];
        info.extend_from_slice(b"shard3");
        assert_eq!(md5sum(&info), &[0u8; 16][..]);
        assert_eq!(locinfo(&info), b"shard3");

        assert_eq!(md5sum(b"short"), b"");
        assert_eq!(locinfo(b"short"), b"short");
    }
}
