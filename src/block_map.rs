use crate::types::CidAndBytes;
use anyhow::Result;
use lexicon_cid::Cid;
use rsky_common::ipld::cid_for_cbor;
use serde::Serialize;
use std::collections::BTreeMap;
use std::str::FromStr;

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct BlockMap {
    pub map: BTreeMap<String, Vec<u8>>,
}

impl BlockMap {
    pub fn new() -> Self {
        BlockMap {
            map: BTreeMap::new(),
        }
    }

    pub fn add<T: Serialize>(&mut self, value: T) -> Result<Cid> {
        let bytes = rsky_common::struct_to_cbor(&value)?;
        let cid = cid_for_cbor(&value)?;
        self.set(cid, bytes);
        Ok(cid)
    }

    pub fn set(&mut self, cid: Cid, bytes: Vec<u8>) {
        self.map.insert(cid.to_string(), bytes);
    }

    pub fn get(&self, cid: Cid) -> Option<Vec<u8>> {
        self.map.get(&cid.to_string()).cloned()
    }

    pub fn delete(&mut self, cid: Cid) -> Result<()> {
        self.map.remove(&cid.to_string());
        Ok(())
    }

    pub fn get_many(&self, cids: Vec<Cid>) -> Result<BlocksAndMissing> {
        let mut missing: Vec<Cid> = Vec::new();
        let mut blocks = BlockMap::new();
        for cid in cids {
            match self.map.get(&cid.to_string()) {
                Some(bytes) => blocks.set(cid, bytes.clone()),
                None => missing.push(cid),
            }
        }
        Ok(BlocksAndMissing { blocks, missing })
    }

    pub fn has(&self, cid: Cid) -> bool {
        self.map.contains_key(&cid.to_string())
    }

    pub fn clear(&mut self) {
        self.map.clear()
    }

    pub fn for_each(&self, cb: impl Fn(&Vec<u8>, Cid)) -> Result<()> {
        for (key, val) in self.map.iter() {
            cb(val, Cid::from_str(key)?);
        }
        Ok(())
    }

    pub fn entries(&self) -> Result<Vec<CidAndBytes>> {
        let mut entries: Vec<CidAndBytes> = Vec::new();
        for (cid, bytes) in self.map.iter() {
            entries.push(CidAndBytes {
                cid: Cid::from_str(cid)?,
                bytes: bytes.clone(),
            });
        }
        Ok(entries)
    }

    pub fn cids(&self) -> Result<Vec<Cid>> {
        Ok(self.entries()?.into_iter().map(|e| e.cid).collect())
    }

    pub fn add_map(&mut self, to_add: BlockMap) -> Result<()> {
        for (cid, bytes) in to_add.map.into_iter() {
            self.map.insert(cid, bytes);
        }
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.map.len()
    }

    pub fn byte_size(&self) -> Result<usize> {
        Ok(self.map.values().map(|bytes| bytes.len()).sum())
    }

    pub fn equals(&self, other: &BlockMap) -> Result<bool> {
        if self.size() != other.size() {
            return Ok(false);
        }
        for entry in self.entries()? {
            match other.get(entry.cid) {
                Some(o) if o == entry.bytes => continue,
                _ => return Ok(false),
            }
        }
        Ok(true)
    }
}

impl IntoIterator for BlockMap {
    type Item = CidAndBytes;
    type IntoIter = std::vec::IntoIter<CidAndBytes>;

    fn into_iter(self) -> Self::IntoIter {
        self.map
            .into_iter()
            .map(|(cid, bytes)| CidAndBytes {
                cid: Cid::from_str(&cid).expect("block map keys are always valid CID strings"),
                bytes,
            })
            .collect::<Vec<_>>()
            .into_iter()
    }
}

#[derive(Debug, Clone)]
pub struct BlocksAndMissing {
    pub blocks: BlockMap,
    pub missing: Vec<Cid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sets_and_gets_blocks() {
        let mut map = BlockMap::new();
        let cid = map.add(&"hello".to_string()).unwrap();
        assert!(map.has(cid));
        assert_eq!(map.get(cid), map.get_many(vec![cid]).unwrap().blocks.get(cid));
    }

    #[test]
    fn reports_missing_blocks() {
        let map = BlockMap::new();
        let cid = cid_for_cbor(&"nope".to_string()).unwrap();
        let got = map.get_many(vec![cid]).unwrap();
        assert_eq!(got.missing, vec![cid]);
        assert_eq!(got.blocks.size(), 0);
    }

    #[test]
    fn merges_block_maps() {
        let mut a = BlockMap::new();
        let mut b = BlockMap::new();
        a.add(&"a".to_string()).unwrap();
        let cid_b = b.add(&"b".to_string()).unwrap();
        a.add_map(b).unwrap();
        assert_eq!(a.size(), 2);
        assert!(a.has(cid_b));
    }
}
