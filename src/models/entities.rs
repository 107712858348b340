//! Tenant-scoped entity types
//!
//! Field validation (prices, permissions, ...) belongs to the collaborators;
//! the engine only needs an id and an ordering per kind.

use std::cmp::Ordering;
use std::fmt::Debug;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::kind::CollectionKind;

// == Entity Trait ==
/// A document the engine can cache, order and reconcile.
///
/// `id` must be unique within a (tenant, kind) pair. Ids are assigned by the
/// remote store on create, so payloads may carry an empty id.
pub trait Entity: Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: CollectionKind;

    fn id(&self) -> &str;

    /// Ordering comparator for the kind. Must be total: ties fall back to id.
    fn compare(a: &Self, b: &Self) -> Ordering;
}

/// Sorts items with the kind's comparator.
pub fn sort_items<T: Entity>(items: &mut [T]) {
    items.sort_by(T::compare);
}

/// Compares labels numerically when both parse as numbers ("2" < "10"),
/// lexically otherwise. Numeric labels sort first.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    match (a.trim().parse::<u64>(), b.trim().parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

// == Table ==
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    #[serde(default)]
    pub id: String,
    pub number: String,
    #[serde(default)]
    pub area: String,
    #[serde(default)]
    pub capacity: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Table {
    pub fn new(number: impl Into<String>, area: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            number: number.into(),
            area: area.into(),
            capacity: 4,
            updated_at: None,
        }
    }
}

impl Entity for Table {
    const KIND: CollectionKind = CollectionKind::Tables;

    fn id(&self) -> &str {
        &self.id
    }

    fn compare(a: &Self, b: &Self) -> Ordering {
        a.area
            .cmp(&b.area)
            .then_with(|| natural_cmp(&a.number, &b.number))
            .then_with(|| a.id.cmp(&b.id))
    }
}

// == Menu Item ==
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MenuItem {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub category_id: String,
    #[serde(default)]
    pub price_cents: u64,
    #[serde(default = "default_true")]
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Entity for MenuItem {
    const KIND: CollectionKind = CollectionKind::MenuItems;

    fn id(&self) -> &str {
        &self.id
    }

    fn compare(a: &Self, b: &Self) -> Ordering {
        a.category_id
            .cmp(&b.category_id)
            .then_with(|| a.name.cmp(&b.name))
            .then_with(|| a.id.cmp(&b.id))
    }
}

// == Category ==
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    #[serde(default)]
    pub id: String,
    pub name: String,
    /// Display position on the menu
    #[serde(default)]
    pub position: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Entity for Category {
    const KIND: CollectionKind = CollectionKind::Categories;

    fn id(&self) -> &str {
        &self.id
    }

    fn compare(a: &Self, b: &Self) -> Ordering {
        a.position
            .cmp(&b.position)
            .then_with(|| a.name.cmp(&b.name))
            .then_with(|| a.id.cmp(&b.id))
    }
}

// == Staff Member ==
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaffMember {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Entity for StaffMember {
    const KIND: CollectionKind = CollectionKind::Staff;

    fn id(&self) -> &str {
        &self.id
    }

    fn compare(a: &Self, b: &Self) -> Ordering {
        a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id))
    }
}

fn default_true() -> bool {
    true
}
