use crate::data_diff::DataDiff;
use crate::types::{
    Commit, Lex, RecordCreateOrDeleteDescript, RecordPath, RecordUpdateDescript, RecordWriteDescript,
    RepoRecord, UnsignedCommit, VersionedCommit, WriteOpAction,
};
use crate::storage::Ipld;
use anyhow::{bail, Result};
use futures::{Stream, StreamExt};
use lexicon_cid::Cid;
use rsky_common::sign::sign_without_indexmap;
use rsky_common::tid::Ticker;
use secp256k1::Keypair;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;

pub fn sign_commit(unsigned: UnsignedCommit, keypair: Keypair) -> Result<Commit> {
    let commit_sig = sign_without_indexmap(&unsigned, &keypair.secret_key())?;
    Ok(Commit {
        did: unsigned.did,
        version: unsigned.version,
        data: unsigned.data,
        rev: unsigned.rev,
        prev: unsigned.prev,
        sig: commit_sig.to_vec(),
    })
}

pub fn verify_commit_sig(commit: Commit, did_key: &String) -> Result<bool> {
    let sig = commit.sig;
    let rest = UnsignedCommit {
        did: commit.did,
        rev: commit.rev,
        data: commit.data,
        prev: commit.prev,
        version: commit.version,
    };
    let encoded = serde_ipld_dagcbor::to_vec(&rest)?;
    let hash = Sha256::digest(&*encoded);
    rsky_crypto::verify::verify_signature(did_key, hash.as_ref(), sig.as_slice(), None)
}

pub fn format_data_key<T: FromStr + Display>(collection: T, rkey: T) -> String {
    format!("{collection}/{rkey}")
}

pub fn lex_to_ipld(val: Lex) -> Ipld {
    match val {
        Lex::List(list) => Ipld::List(list.into_iter().map(lex_to_ipld).collect::<Vec<Ipld>>()),
        Lex::Map(map) => {
            let mut to_return: BTreeMap<String, Ipld> = BTreeMap::new();
            for (key, value) in map {
                to_return.insert(key, lex_to_ipld(value));
            }
            Ipld::Map(to_return)
        }
        Lex::Ipld(ipld) => match ipld {
            Ipld::Json(json_val) => match serde_json::from_value::<Cid>(json_val.clone()) {
                Ok(cid) => Ipld::Link(cid),
                Err(_) => Ipld::Json(json_val),
            },
            _ => ipld,
        },
    }
}

pub fn ipld_to_lex(val: Ipld) -> Lex {
    match val {
        Ipld::List(list) => Lex::List(list.into_iter().map(ipld_to_lex).collect::<Vec<Lex>>()),
        Ipld::Map(map) => {
            let mut to_return: BTreeMap<String, Lex> = BTreeMap::new();
            for (key, value) in map {
                to_return.insert(key, ipld_to_lex(value));
            }
            Lex::Map(to_return)
        }
        _ => Lex::Ipld(val),
    }
}

pub fn cbor_to_lex(val: Vec<u8>) -> Result<Lex> {
    let obj: Ipld = serde_ipld_dagcbor::from_slice(val.as_slice())?;
    Ok(ipld_to_lex(obj))
}

pub fn cbor_to_lex_record(val: Vec<u8>) -> Result<RepoRecord> {
    match cbor_to_lex(val)? {
        Lex::Map(map) => Ok(map),
        _ => bail!("Lexicon record should be a json object"),
    }
}

pub fn parse_data_key(key: &String) -> Result<RecordPath> {
    let parts: Vec<&str> = key.split('/').collect();
    if parts.len() != 2 {
        bail!("Invalid record key: `{key:?}`");
    }
    Ok(RecordPath {
        collection: parts[0].to_owned(),
        rkey: parts[1].to_owned(),
    })
}

pub fn ensure_v3_commit(commit: VersionedCommit) -> Commit {
    match commit {
        VersionedCommit::Commit(commit) if commit.version == 3 => commit,
        VersionedCommit::Commit(commit) => Commit {
            did: commit.did,
            version: 3,
            data: commit.data,
            rev: commit.rev,
            prev: commit.prev,
            sig: commit.sig,
        },
        VersionedCommit::LegacyV2Commit(commit) => Commit {
            did: commit.did,
            version: 3,
            data: commit.data,
            rev: commit.rev.unwrap_or(Ticker::new().next(None).0),
            prev: commit.prev,
            sig: commit.sig,
        },
    }
}

/// Flattens a collection of byte vectors into a single vector
pub fn flatten_u8_arrays(chunks: &[Vec<u8>]) -> Vec<u8> {
    let mut result = Vec::with_capacity(chunks.iter().map(|v| v.len()).sum());
    for chunk in chunks {
        result.extend_from_slice(chunk);
    }
    result
}

/// Collects a stream of byte chunks into a single buffer
pub async fn stream_to_buffer<S>(mut stream: S) -> Result<Vec<u8>>
where
    S: Stream<Item = Result<Vec<u8>>> + Unpin,
{
    let mut buffer = Vec::new();
    while let Some(chunk) = stream.next().await {
        buffer.extend_from_slice(&chunk?);
    }
    Ok(buffer)
}

/// Turns an MST-level diff into record-level write descriptions, splitting each
/// `collection/rkey` data key back into its two parts.
pub fn diff_to_write_descripts(diff: &DataDiff) -> Result<Vec<RecordWriteDescript>> {
    let mut descripts = Vec::new();
    for add in diff.add_list() {
        let path = parse_data_key(&add.key)?;
        descripts.push(RecordWriteDescript::Create(RecordCreateOrDeleteDescript {
            action: WriteOpAction::Create,
            collection: path.collection,
            rkey: path.rkey,
            cid: add.cid,
        }));
    }
    for update in diff.update_list() {
        let path = parse_data_key(&update.key)?;
        descripts.push(RecordWriteDescript::Update(RecordUpdateDescript {
            action: WriteOpAction::Update,
            collection: path.collection,
            rkey: path.rkey,
            prev: update.prev,
            cid: update.cid,
        }));
    }
    for delete in diff.delete_list() {
        let path = parse_data_key(&delete.key)?;
        descripts.push(RecordWriteDescript::Delete(RecordCreateOrDeleteDescript {
            action: WriteOpAction::Delete,
            collection: path.collection,
            rkey: path.rkey,
            cid: delete.cid,
        }));
    }
    Ok(descripts)
}

/// Asserts that a batch of write descriptions are all creates, as required when building
/// the very first commit of a repo (there is nothing yet to update or delete).
pub fn ensure_creates(writes: Vec<RecordWriteDescript>) -> Result<Vec<RecordCreateOrDeleteDescript>> {
    writes
        .into_iter()
        .map(|write| match write {
            RecordWriteDescript::Create(descript) => Ok(descript),
            RecordWriteDescript::Update(descript) => {
                bail!(
                    "Unexpected update write in initial commit at `{}/{}`",
                    descript.collection,
                    descript.rkey
                )
            }
            RecordWriteDescript::Delete(descript) => {
                bail!(
                    "Unexpected delete write in initial commit at `{}/{}`",
                    descript.collection,
                    descript.rkey
                )
            }
        })
        .collect()
}
