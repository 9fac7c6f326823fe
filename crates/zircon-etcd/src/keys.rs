//! Etcd key layout and stored document types.
//!
//! ```text
//! /servers/<name>      -> RegistryEntry JSON          (session-lease bound)
//! /server-id/<id>      -> <name>                      (persistent)
//! /shards/<shardId>    -> <ownerName>                 (metadata-lease bound)
//! /meta/<chunkId>      -> Metametadata JSON
//! /counter/<shardId>   -> next chunk counter
//! /counter-server-id   -> next server id
//! ```

use serde::{Deserialize, Serialize};
use zircon_common::{ChunkId, ServerAddress, ServerId, ServerName, ServerRole, ShardId};

pub const SERVERS_PREFIX: &str = "/servers/";
pub const SERVER_ID_PREFIX: &str = "/server-id/";
pub const SHARDS_PREFIX: &str = "/shards/";
pub const META_PREFIX: &str = "/meta/";
pub const COUNTER_PREFIX: &str = "/counter/";
pub const SERVER_ID_COUNTER: &str = "/counter-server-id";

/// Value stored under `/servers/<name>`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub address: ServerAddress,
    pub role: ServerRole,
    pub id: ServerId,
}

#[must_use]
pub fn server_key(name: &ServerName) -> String {
    format!("{SERVERS_PREFIX}{name}")
}

#[must_use]
pub fn server_id_key(id: ServerId) -> String {
    format!("{SERVER_ID_PREFIX}{id}")
}

#[must_use]
pub fn shard_key(shard: ShardId) -> String {
    format!("{SHARDS_PREFIX}{shard}")
}

#[must_use]
pub fn meta_key(id: ChunkId) -> String {
    format!("{META_PREFIX}{}", id.to_hex())
}

#[must_use]
pub fn counter_key(shard: ShardId) -> String {
    format!("{COUNTER_PREFIX}{shard}")
}

#[must_use]
pub fn parse_server_key(key: &str) -> Option<ServerName> {
    key.strip_prefix(SERVERS_PREFIX)
        .filter(|rest| !rest.is_empty())
        .map(ServerName::new)
}

#[must_use]
pub fn parse_server_id_key(key: &str) -> Option<ServerId> {
    key.strip_prefix(SERVER_ID_PREFIX)?
        .parse()
        .ok()
        .map(ServerId::from_raw)
}

#[must_use]
pub fn parse_shard_key(key: &str) -> Option<ShardId> {
    key.strip_prefix(SHARDS_PREFIX)?
        .parse()
        .ok()
        .map(ShardId::from_raw)
}

#[must_use]
pub fn parse_meta_key(key: &str) -> Option<ChunkId> {
    ChunkId::from_hex(key.strip_prefix(META_PREFIX)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_round_trip() {
        let name = ServerName::new("topaz-5");
        assert_eq!(parse_server_key(&server_key(&name)), Some(name));

        let shard = ShardId::from_raw(42);
        assert_eq!(shard_key(shard), "/shards/42");
        assert_eq!(parse_shard_key(&shard_key(shard)), Some(shard));

        let id = ChunkId::from_raw(0x1234);
        assert_eq!(parse_meta_key(&meta_key(id)), Some(id));

        assert_eq!(parse_server_key("/servers/"), None);
        assert_eq!(parse_shard_key("/shards/nope"), None);
    }
}
