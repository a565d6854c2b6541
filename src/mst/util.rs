use crate::mst::{Leaf, NodeData, NodeEntry, TreeEntry, MST};
use crate::storage::types::RepoStorage;
use anyhow::{anyhow, Result};
use lazy_static::lazy_static;
use lexicon_cid::Cid;
use rand::{thread_rng, Rng};
use regex::Regex;
use rsky_common::ipld::cid_for_cbor;
use rsky_common::tid::Ticker;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::str;
use std::sync::Arc;
use tokio::sync::RwLock;

fn is_valid_chars(input: &str) -> bool {
    lazy_static! {
        static ref RE: Regex = Regex::new(r"^[a-zA-Z0-9_\-:.]*$").unwrap();
    }
    RE.is_match(input)
}

/// * Restricted to a subset of ASCII characters — the allowed characters are
/// alphanumeric (A-Za-z0-9), period, dash, underscore, colon, or tilde (.-_:~)
/// * Must have at least 1 and at most 512 characters
/// * The specific record key values . and .. are not allowed
pub fn is_valid_repo_mst_path(key: &str) -> Result<bool> {
    let split: Vec<&str> = key.split('/').collect();
    Ok(key.len() <= 256
        && split.len() == 2
        && !split[0].is_empty()
        && !split[1].is_empty()
        && is_valid_chars(split[0])
        && is_valid_chars(split[1]))
}

pub fn ensure_valid_mst_key(key: &str) -> Result<()> {
    match is_valid_repo_mst_path(key)? {
        true => Ok(()),
        false => Err(anyhow!("Invalid MST Key: {}", key)),
    }
}

pub async fn cid_for_entries(entries: &[NodeEntry]) -> Result<Cid> {
    let data = serialize_node_data(entries).await?;
    cid_for_cbor(&data)
}

pub fn count_prefix_len(a: &str, b: &str) -> Result<usize> {
    let mut x = 0;
    for (a_char, b_char) in a.chars().zip(b.chars()) {
        if a_char == b_char {
            x += 1;
        } else {
            break;
        }
    }
    Ok(x)
}

pub async fn serialize_node_data(entries: &[NodeEntry]) -> Result<NodeData> {
    let mut data = NodeData {
        l: None,
        e: Vec::new(),
    };
    let mut i = 0;
    if let Some(NodeEntry::MST(e)) = entries.get(0) {
        i += 1;
        data.l = Some(e.get_pointer().await?);
    }
    let mut last_key = String::new();
    while i < entries.len() {
        let leaf = &entries[i];
        let next = entries.get(i + 1);
        if let NodeEntry::Leaf(l) = leaf {
            i += 1;
            let mut subtree: Option<Cid> = None;
            if let Some(NodeEntry::MST(tree)) = next {
                subtree = Some(tree.get_pointer().await?);
                i += 1;
            }
            ensure_valid_mst_key(&l.key)?;
            let prefix_len = count_prefix_len(&last_key, &l.key)?;
            data.e.push(TreeEntry {
                p: u8::try_from(prefix_len)?,
                k: l.key[prefix_len..].to_owned().into_bytes(),
                v: l.value,
                t: subtree,
            });
            last_key = l.key.clone();
        } else {
            return Err(anyhow!("Not a valid node: two subtrees next to each other"));
        }
    }
    Ok(data)
}

pub fn deserialize_node_data(
    storage: Arc<RwLock<dyn RepoStorage>>,
    data: &NodeData,
    layer: Option<u32>,
) -> Result<Vec<NodeEntry>> {
    let mut entries: Vec<NodeEntry> = Vec::new();
    if let Some(l) = data.l {
        let new_layer = layer.map(|layer| layer - 1);
        let mst = MST::load(storage.clone(), l, new_layer)?;
        entries.push(NodeEntry::MST(mst));
    }
    let mut last_key = String::new();
    for entry in data.e.iter() {
        let key_str = str::from_utf8(entry.k.as_ref())?;
        let p = usize::try_from(entry.p)?;
        let key = format!("{}{}", &last_key[0..p], key_str);
        ensure_valid_mst_key(&key)?;
        entries.push(NodeEntry::Leaf(Leaf {
            key: key.clone(),
            value: entry.v,
        }));
        last_key = key;
        if let Some(t) = entry.t {
            let new_layer = layer.map(|layer| layer - 1);
            let mst = MST::load(storage.clone(), t, new_layer)?;
            entries.push(NodeEntry::MST(mst));
        }
    }
    Ok(entries)
}

pub fn layer_for_entries(entries: &[NodeEntry]) -> Result<Option<u32>> {
    let first_leaf = entries.iter().find(|entry| entry.is_leaf());
    match first_leaf {
        Some(NodeEntry::Leaf(l)) => Ok(Some(leading_zeros_on_hash(l.key.as_bytes())?)),
        _ => Ok(None),
    }
}

/// Counts the number of leading zero *bits*, in 2-bit steps, of the SHA-256
/// digest of `key`. This yields ~4-way fanout (2 bits of zero per layer).
pub fn leading_zeros_on_hash(key: &[u8]) -> Result<u32> {
    let digest = Sha256::digest(key);
    let hash: &[u8] = digest.as_ref();
    let mut leading_zeros = 0;
    for byte in hash {
        if *byte < 64 {
            leading_zeros += 1;
        }
        if *byte < 16 {
            leading_zeros += 1;
        }
        if *byte < 4 {
            leading_zeros += 1;
        }
        if *byte == 0 {
            leading_zeros += 1;
        } else {
            break;
        }
    }
    Ok(leading_zeros)
}

pub fn short_cid(cid: &Cid) -> String {
    let s = cid.to_string();
    if s.len() <= 8 {
        s
    } else {
        format!("{}..{}", &s[..4], &s[s.len() - 4..])
    }
}

pub type IdMapping = BTreeMap<String, Cid>;

pub async fn random_cid(
    storage: &mut Option<&mut dyn RepoStorage>,
    rev: Option<String>,
) -> Result<Cid> {
    let record = json!({ "test": random_str(50) });
    let cid = cid_for_cbor(&record)?;
    let bytes = rsky_common::struct_to_cbor(&record)?;
    if let Some(storage) = storage {
        storage
            .put_block(cid, bytes, rev.unwrap_or_default())
            .await?;
    }
    Ok(cid)
}

pub async fn generate_bulk_data_keys(
    count: usize,
    mut storage: Option<&mut dyn RepoStorage>,
) -> Result<IdMapping> {
    let mut obj: IdMapping = BTreeMap::new();
    for _ in 0..count {
        let key = format!("com.example.record/{}", Ticker::new().next(None).0);
        let cid = random_cid(&mut storage, None).await?;
        obj.insert(key, cid);
    }
    Ok(obj)
}

pub fn random_str(len: usize) -> String {
    const CHARSET: &[u8] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";
    let charset_len = CHARSET.len();
    let mut rng = thread_rng();

    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..charset_len);
            CHARSET[idx] as char
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leading_zeros() {
        assert_eq!(leading_zeros_on_hash("".as_bytes()).unwrap(), 0);
        assert_eq!(leading_zeros_on_hash("asdf".as_bytes()).unwrap(), 0);
        assert_eq!(leading_zeros_on_hash("blue".as_bytes()).unwrap(), 1);
        assert_eq!(leading_zeros_on_hash("2653ae71".as_bytes()).unwrap(), 0);
        assert_eq!(leading_zeros_on_hash("88bfafc7".as_bytes()).unwrap(), 2);
        assert_eq!(leading_zeros_on_hash("2a92d355".as_bytes()).unwrap(), 4);
        assert_eq!(leading_zeros_on_hash("884976f5".as_bytes()).unwrap(), 6);
        assert_eq!(
            leading_zeros_on_hash("app.bsky.feed.post/454397e440ec".as_bytes()).unwrap(),
            4
        );
        assert_eq!(
            leading_zeros_on_hash("app.bsky.feed.post/9adeb165882c".as_bytes()).unwrap(),
            8
        );
    }

    #[test]
    fn test_prefix_len() {
        assert_eq!(count_prefix_len("abc", "abc").unwrap(), 3);
        assert_eq!(count_prefix_len("", "abc").unwrap(), 0);
        assert_eq!(count_prefix_len("abc", "").unwrap(), 0);
        assert_eq!(count_prefix_len("ab", "abc").unwrap(), 2);
        assert_eq!(count_prefix_len("abc", "abd").unwrap(), 2);
    }

    #[test]
    fn test_prefix_len_wide() {
        // multi-byte utf8 characters must be compared as whole chars, not bytes
        assert_eq!(count_prefix_len("jalapeñoA", "jalapeñoB").unwrap(), 8);
        assert_eq!(count_prefix_len("jalapeñoA", "jalapeñoA").unwrap(), 9);
        assert_eq!(count_prefix_len("coöperative", "coöperator").unwrap(), 8);
        assert_eq!(count_prefix_len("abc", "abc💩").unwrap(), 3);
        assert_eq!(count_prefix_len("💩abc", "💩abc").unwrap(), 4);
    }

    #[test]
    fn test_allowed_keys() {
        let long_key = format!("com.example.foo/{}", "o".repeat(256 - 17));
        let cases: Vec<(&str, bool)> = vec![
            ("com.example.foo/3jui7kd54zh2y", true),
            ("com.example.foo/3jui7kd54zh2Y", true),
            ("com.example.foo/3jui7kd54zh2y123", true),
            ("com.example.foo/0", true),
            ("com.example.foo/dHJ1ZQ", true),
            ("com.example.foo/_", true),
            ("com.example.foo/~", false),
            ("com.example.foo/-", true),
            ("com.example.foo/:", true),
            (long_key.as_str(), true),
            ("com.example.foo", false),
            ("com.example.foo/bar/baz", false),
            ("com.example.foo/*", false),
            ("com.example.foo/;", false),
            ("com.example.foo/,", false),
            ("com.example.foo/", false),
            ("com.example.foo/#", false),
            ("com.example.foo/jalapeñoA", false),
            ("", false),
            ("/", false),
        ];
        for (key, expected) in cases {
            assert_eq!(
                is_valid_repo_mst_path(&key.to_string()).unwrap(),
                expected,
                "key: {}",
                key
            );
        }
    }
}
