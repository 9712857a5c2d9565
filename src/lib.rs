//! The `treecast` library disseminates large read-only values from a single
//! producer to many worker processes over a tree-structured peer swarm.
//! Every worker that finishes pulling a value becomes a seeder for later
//! arrivals, so aggregate fan-out bandwidth grows with the number of
//! participants instead of bottlenecking on the producer's network card.
//!
//! The pieces, leaves first: [`block`](block/index.html) splits an encoded
//! value into fixed-size indexed blocks; [`block_server`](block_server/index.html)
//! and [`block_client`](block_client/index.html) ship those blocks between
//! peers; [`guide`](guide/index.html) introduces each arriving leecher to a
//! suitable seeder; [`tracker`](tracker/index.html) maps broadcast ids to
//! guide endpoints; [`broadcast`](broadcast/index.html) ties it all together
//! behind a lazily-dereferenced handle with a shared-filesystem fallback.

pub mod block;
pub mod block_client;
pub mod block_server;
pub mod broadcast;
pub mod broadcast_id;
pub mod fallback;
pub mod frame;
pub mod guide;
pub mod logger;
pub mod object_cache;
pub mod result;
pub mod service;
pub mod tracker;

#[macro_use]
extern crate log;

#[macro_use]
extern crate serde_derive;

#[cfg(test)]
#[macro_use]
extern crate assert_matches;
