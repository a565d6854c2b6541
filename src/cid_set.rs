use lexicon_cid::Cid;
use std::collections::HashSet;
use std::str::FromStr;

/// A set of CIDs, keyed internally by their string form so it can derive
/// equality and (de)serialize without pulling in a custom `Cid` hasher.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct CidSet {
    pub set: HashSet<String>,
}

impl CidSet {
    pub fn new(arr: Option<Vec<Cid>>) -> Self {
        let str_arr: Vec<String> = arr
            .unwrap_or_default()
            .into_iter()
            .map(|cid| cid.to_string())
            .collect();
        CidSet {
            set: HashSet::from_iter(str_arr),
        }
    }

    pub fn add(&mut self, cid: Cid) {
        self.set.insert(cid.to_string());
    }

    pub fn add_set(&mut self, to_merge: CidSet) {
        for cid in to_merge.to_list() {
            self.add(cid);
        }
    }

    pub fn subtract_set(&mut self, to_subtract: CidSet) {
        for cid in to_subtract.to_list() {
            self.delete(cid);
        }
    }

    pub fn delete(&mut self, cid: Cid) {
        self.set.remove(&cid.to_string());
    }

    pub fn has(&self, cid: Cid) -> bool {
        self.set.contains(&cid.to_string())
    }

    pub fn size(&self) -> usize {
        self.set.len()
    }

    pub fn clear(&mut self) {
        self.set.clear();
    }

    pub fn to_list(&self) -> Vec<Cid> {
        self.set
            .iter()
            .filter_map(|cid| Cid::from_str(cid).ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsky_common::ipld::cid_for_cbor;

    #[test]
    fn adds_and_subtracts_sets() {
        let cid_a = cid_for_cbor(&"a".to_string()).unwrap();
        let cid_b = cid_for_cbor(&"b".to_string()).unwrap();
        let mut set = CidSet::new(Some(vec![cid_a]));
        set.add_set(CidSet::new(Some(vec![cid_b])));
        assert_eq!(set.size(), 2);
        set.subtract_set(CidSet::new(Some(vec![cid_b])));
        assert!(set.has(cid_a));
        assert!(!set.has(cid_b));
    }
}
