//! redb table definitions for the rekon resource store.
//!
//! One table holds every object. Keys are hierarchical paths built by the
//! `key_for` helpers on the `rekon-core` types; values are JSON bytes.

use redb::TableDefinition;

/// All stored objects keyed by `/{kind}/...` path.
pub const OBJECTS: TableDefinition<&str, &[u8]> = TableDefinition::new("objects");
