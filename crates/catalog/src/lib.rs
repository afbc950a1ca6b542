//! The inventory side of the agent: the tag-indexed catalog of hosts,
//! credentials and command groups, and the loader/sharder that feeds it.
//! Tags are the sole linkage mechanism between the three catalogs.

mod hosts;
mod inventory;

pub use self::hosts::{
    tag_matches, AuthMethod, CommandGroup, CommandLines, Credential, DeviceType, Host,
    HostManager, RawCommandGroup, RawCredential, TagList, DEFAULT_INTERVAL_SECS,
};
pub use self::inventory::{
    shard_host_list, Inventory, InventoryEntry, InventorySource, ShardError, ShardSpec,
};
