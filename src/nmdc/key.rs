//! The `$Lock` / `$Key` challenge, and the escaping of bytes that may not appear in it.

/// Bytes that cannot travel raw inside a key.
const FORBIDDEN: [u8; 6] = [0, 5, 36, 96, 124, 126];

/// Computes the answer to a `$Lock` challenge.
pub(crate) fn lock_to_key(lock: &[u8]) -> Vec<u8> {
    let len = lock.len();

    if len < 3 {
        return Vec::new();
    }

    let mut key = vec![0u8; len];
    key[0] = lock[0] ^ lock[len - 1] ^ lock[len - 2] ^ 5;
    for i in 1..len {
        key[i] = lock[i] ^ lock[i - 1];
    }

    for byte in key.iter_mut() {
        *byte = byte.rotate_left(4);
    }

    escape(&key)
}

/// Replaces every forbidden byte with `/%DCNnnn%/`.
fn escape(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());

    for &byte in bytes {
        if FORBIDDEN.contains(&byte) {
            out.extend_from_slice(format!("/%DCN{:03}%/", byte).as_bytes());
        } else {
            out.push(byte);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_of_short_lock() {
        // 'A'^'C'^'B'^5 = 0x45, 'B'^'A' = 0x03, 'C'^'B' = 0x01, then nibbles swapped.
        assert_eq!(lock_to_key(b"ABC"), vec![0x54, 0x30, 0x10]);
    }

    #[test]
    fn key_escapes_forbidden_bytes() {
        assert_eq!(
            lock_to_key(b"AAAA"),
            b"D/%DCN000%//%DCN000%//%DCN000%/".to_vec()
        );
    }

    #[test]
    fn escapes_every_forbidden_byte() {
        let raw = [b'a', 0, 5, b'$', b'`', b'|', b'~', b'z'];

        assert_eq!(
            escape(&raw),
            b"a/%DCN000%//%DCN005%//%DCN036%//%DCN096%//%DCN124%//%DCN126%/z".to_vec()
        );
    }
}
