//! redb table definitions for the fleet state store.

use redb::TableDefinition;

/// Target documents keyed by `{domain}/{role}/{worker}/{kind}`.
pub const TARGETS: TableDefinition<&str, &[u8]> = TableDefinition::new("targets");
