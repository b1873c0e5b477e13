//! Key hashing: account/container/object paths to partitions.

use md5::{Digest, Md5};

/// Salted MD5 hashing of object paths.
///
/// The prefix and suffix are cluster secrets; every process reading the same
/// ring must use the same values or lookups disagree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathHasher {
    prefix: String,
    suffix: String,
}

impl PathHasher {
    /// Creates a hasher with the given salts.
    pub fn new(prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: suffix.into(),
        }
    }

    /// Digest of `/account[/container[/object]]` wrapped in the salts.
    ///
    /// `object` is ignored when `container` is absent.
    pub fn hash_path(&self, account: &str, container: Option<&str>, object: Option<&str>) -> [u8; 16] {
        let mut hasher = Md5::new();
        hasher.update(self.prefix.as_bytes());
        hasher.update(b"/");
        hasher.update(account.as_bytes());
        if let Some(container) = container {
            hasher.update(b"/");
            hasher.update(container.as_bytes());
            if let Some(object) = object {
                hasher.update(b"/");
                hasher.update(object.as_bytes());
            }
        }
        hasher.update(self.suffix.as_bytes());
        hasher.finalize().into()
    }

    /// Hex form of [`hash_path`](Self::hash_path).
    pub fn hash_path_hex(&self, account: &str, container: Option<&str>, object: Option<&str>) -> String {
        self.hash_path(account, container, object)
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}

/// Top bits of a digest: the first four bytes as a big-endian integer,
/// shifted right by `part_shift`.
pub fn partition_for_digest(digest: &[u8; 16], part_shift: u32) -> usize {
    let top = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) as u64;
    top.checked_shr(part_shift).unwrap_or(0) as usize
}

/// First partition visited when searching handoffs for `part`: the unsalted
/// MD5 of the decimal partition number, reduced the same way as a key.
pub fn handoff_start(part: usize, part_shift: u32) -> usize {
    let digest: [u8; 16] = Md5::digest(part.to_string().as_bytes()).into();
    partition_for_digest(&digest, part_shift)
}
