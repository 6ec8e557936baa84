//
// Copyright (c) 2024 Nathan Fiedler
//

//! Small helpers shared by the planners: the reversible encoding of
//! child names used in the metadata document and on the remote, and the
//! raw-byte view of file names that keeps checksums independent of any
//! text encoding.

use anyhow::{anyhow, Error};
use data_encoding::BASE32_NOPAD;
use std::ffi::{OsStr, OsString};
use std::path::Path;

pub mod digest;
pub mod links;

///
/// Encode a raw file name for use in JSON and as a remote path
/// component. Base32 without padding; the result never contains `.`,
/// so encoded names cannot collide with pack names, which always do.
///
pub fn encode_child(name: &[u8]) -> String {
    BASE32_NOPAD.encode(name)
}

/// Invert [`encode_child`].
pub fn decode_child(name: &str) -> Result<Vec<u8>, Error> {
    BASE32_NOPAD
        .decode(name.as_bytes())
        .map_err(|err| anyhow!(format!("invalid encoded name {}: {}", name, err)))
}

/// View an operating system string as raw bytes.
#[cfg(target_family = "unix")]
pub fn os_bytes(value: &OsStr) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    value.as_bytes().to_vec()
}

// Windows names reach tar through MSYS as UTF-8.
#[cfg(target_family = "windows")]
pub fn os_bytes(value: &OsStr) -> Vec<u8> {
    value.to_string_lossy().into_owned().into_bytes()
}

/// Rebuild an operating system string from raw bytes.
#[cfg(target_family = "unix")]
pub fn bytes_to_os(bytes: &[u8]) -> OsString {
    use std::os::unix::ffi::OsStringExt;
    OsString::from_vec(bytes.to_vec())
}

#[cfg(target_family = "windows")]
pub fn bytes_to_os(bytes: &[u8]) -> OsString {
    OsString::from(String::from_utf8_lossy(bytes).into_owned())
}

/// The final component of a path as raw bytes, empty if there is none.
pub fn name_bytes(path: &Path) -> Vec<u8> {
    path.file_name().map(os_bytes).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_child_known_values() {
        assert_eq!(encode_child(b"a"), "ME");
        assert_eq!(encode_child(b"hello"), "NBSWY3DP");
        assert_eq!(encode_child(b""), "");
    }

    #[test]
    fn test_codec_roundtrip() {
        for name in [
            b"simple.txt".to_vec(),
            b"with space".to_vec(),
            b"\xffnot utf8\xfe".to_vec(),
            vec![0u8, 1, 2, 3],
        ] {
            let encoded = encode_child(&name);
            assert!(encoded
                .chars()
                .all(|c| c.is_ascii_uppercase() || ('2'..='7').contains(&c)));
            assert_eq!(decode_child(&encoded).unwrap(), name);
        }
    }

    #[test]
    fn test_decode_child_rejects_invalid() {
        assert!(decode_child("lowercase").is_err());
        assert!(decode_child("ME=").is_err());
        assert!(decode_child("0189").is_err());
    }

    #[test]
    fn test_name_bytes() {
        assert_eq!(name_bytes(Path::new("/tmp/hello.txt")), b"hello.txt");
        assert_eq!(name_bytes(Path::new("/")), b"");
    }
}
