#[macro_use]
extern crate serde_derive;
extern crate core;
extern crate serde;

pub mod block_map;
pub mod car;
pub mod cid_set;
pub mod data_diff;
pub mod durable;
pub mod error;
pub mod event;
pub mod firehose;
pub mod manager;
pub mod mst;
pub mod parse;
pub mod readable_repo;
pub mod registry;
pub mod repo;
pub mod sequencer;
pub mod storage;
pub mod sync;
pub mod types;
pub mod util;
pub mod validator;
pub mod vendored;
