//! Tenant and collection identifiers
//!
//! Every cache key and remote path is scoped by a [`TenantId`] and a
//! [`CollectionKind`]. Each kind carries its own TTL.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// == Tenant Id ==
/// Opaque identifier of the restaurant that owns a collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for TenantId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// == Collection Kind ==
/// Entity collections managed by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionKind {
    Tables,
    MenuItems,
    Categories,
    Staff,
}

impl CollectionKind {
    pub const ALL: [CollectionKind; 4] = [
        CollectionKind::Tables,
        CollectionKind::MenuItems,
        CollectionKind::Categories,
        CollectionKind::Staff,
    ];

    /// Path segment used for cache keys and remote collection names.
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionKind::Tables => "tables",
            CollectionKind::MenuItems => "menu_items",
            CollectionKind::Categories => "categories",
            CollectionKind::Staff => "staff",
        }
    }

    /// Built-in TTL. Rarely-changing collections live for hours; menu items
    /// are cross-checked against server-side pricing and expire quickly.
    pub fn default_ttl(&self) -> Duration {
        match self {
            CollectionKind::Tables => Duration::from_secs(24 * 60 * 60),
            CollectionKind::Categories => Duration::from_secs(12 * 60 * 60),
            CollectionKind::Staff => Duration::from_secs(6 * 60 * 60),
            CollectionKind::MenuItems => Duration::from_secs(30 * 60),
        }
    }
}

impl fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CollectionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CollectionKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s || (s == "menu-items" && *kind == Self::MenuItems))
            .ok_or_else(|| format!("unknown collection kind: {}", s))
    }
}

// == TTL Table ==
/// Per-kind TTLs, defaults overridable from configuration.
#[derive(Debug, Clone, Default)]
pub struct TtlTable {
    overrides: HashMap<CollectionKind, Duration>,
}

impl TtlTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, kind: CollectionKind, ttl: Duration) -> Self {
        self.overrides.insert(kind, ttl);
        self
    }

    pub fn ttl(&self, kind: CollectionKind) -> Duration {
        self.overrides
            .get(&kind)
            .copied()
            .unwrap_or_else(|| kind.default_ttl())
    }

    /// TTL in milliseconds, the unit used by cache timestamps.
    pub fn ttl_ms(&self, kind: CollectionKind) -> u64 {
        self.ttl(kind).as_millis() as u64
    }
}
