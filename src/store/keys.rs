//! Key layout for the metadata tree
//!
//! Every record family lives under its own two-byte prefix. File and history
//! keys embed the owning root key first so a whole root (or a single path)
//! can be removed with one prefix scan. Variable-length segments are written
//! as a big-endian `u32` length followed by the raw bytes, which keeps one
//! root's prefix from ever matching a longer sibling (`/docs` vs `/docs2`).

use uuid::Uuid;

/// Client records: `c/` + 16-byte UUID
pub const CLIENT_PREFIX: &[u8] = b"c/";
/// Root directory records: `d/` + root key
pub const ROOT_PREFIX: &[u8] = b"d/";
/// Latest file state: `f/` + seg(root) + seg(path)
pub const FILE_PREFIX: &[u8] = b"f/";
/// History records: `h/` + seg(root) + seg(path) + timestamp (u64 BE)
pub const HISTORY_PREFIX: &[u8] = b"h/";
/// Pending cascade markers: `s/` + seg(root) [+ seg(path)]
pub const SWEEP_PREFIX: &[u8] = b"s/";

fn push_segment(buf: &mut Vec<u8>, segment: &str) {
    buf.extend_from_slice(&(segment.len() as u32).to_be_bytes());
    buf.extend_from_slice(segment.as_bytes());
}

fn with_prefix(prefix: &[u8], capacity: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + capacity);
    key.extend_from_slice(prefix);
    key
}

pub fn client(uuid: &Uuid) -> Vec<u8> {
    let mut key = with_prefix(CLIENT_PREFIX, 16);
    key.extend_from_slice(uuid.as_bytes());
    key
}

pub fn root(root: &str) -> Vec<u8> {
    let mut key = with_prefix(ROOT_PREFIX, root.len());
    key.extend_from_slice(root.as_bytes());
    key
}

/// Prefix covering every file record of one root
pub fn file_root_prefix(root: &str) -> Vec<u8> {
    let mut key = with_prefix(FILE_PREFIX, 4 + root.len());
    push_segment(&mut key, root);
    key
}

pub fn file(root: &str, path: &str) -> Vec<u8> {
    let mut key = file_root_prefix(root);
    push_segment(&mut key, path);
    key
}

/// Prefix covering every history record of one root
pub fn history_root_prefix(root: &str) -> Vec<u8> {
    let mut key = with_prefix(HISTORY_PREFIX, 4 + root.len());
    push_segment(&mut key, root);
    key
}

/// Prefix covering every history record of one path, in timestamp order
pub fn history_path_prefix(root: &str, path: &str) -> Vec<u8> {
    let mut key = history_root_prefix(root);
    push_segment(&mut key, path);
    key
}

pub fn history(root: &str, path: &str, timestamp: u64) -> Vec<u8> {
    let mut key = history_path_prefix(root, path);
    key.extend_from_slice(&timestamp.to_be_bytes());
    key
}

/// Marker for an in-progress cascade over a root (`path = None`) or one file
pub fn sweep(root: &str, path: Option<&str>) -> Vec<u8> {
    let mut key = with_prefix(SWEEP_PREFIX, 8 + root.len());
    push_segment(&mut key, root);
    if let Some(path) = path {
        push_segment(&mut key, path);
    }
    key
}

fn read_segment(bytes: &[u8]) -> Option<(&str, &[u8])> {
    let len_bytes: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    let segment = bytes.get(4..4 + len)?;
    let rest = &bytes[4 + len..];
    Some((std::str::from_utf8(segment).ok()?, rest))
}

/// Split a file key into `(root, path)`
pub fn parse_file(key: &[u8]) -> Option<(String, String)> {
    let body = key.strip_prefix(FILE_PREFIX)?;
    let (root, rest) = read_segment(body)?;
    let (path, rest) = read_segment(rest)?;
    if !rest.is_empty() {
        return None;
    }
    Some((root.to_string(), path.to_string()))
}

/// Split a history key into `(root, path, timestamp)`
pub fn parse_history(key: &[u8]) -> Option<(String, String, u64)> {
    let body = key.strip_prefix(HISTORY_PREFIX)?;
    let (root, rest) = read_segment(body)?;
    let (path, rest) = read_segment(rest)?;
    let ts: [u8; 8] = rest.try_into().ok()?;
    Some((root.to_string(), path.to_string(), u64::from_be_bytes(ts)))
}
