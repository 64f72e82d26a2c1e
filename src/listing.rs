//! Listing identifier/record types and the status state machine.
//!
//! Every identifier row carries a [`ListingStatus`]; all status changes go
//! through the transition table in [`ListingStatus::can_transition`] so that
//! no backend or caller can regress a row (e.g. `scraped` back to `pending`
//! just because discovery saw the listing again).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle status of a listing identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    /// Identifier known, detail page not yet captured.
    Pending,
    /// Detail page captured and a property record written.
    Scraped,
    /// Detail fetch or parse failed; eligible for retry.
    Failed,
    /// Source site no longer lists the identifier.
    Inactive,
}

impl ListingStatus {
    /// Returns the storage string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scraped => "scraped",
            Self::Failed => "failed",
            Self::Inactive => "inactive",
        }
    }

    /// Whether a transition from `self` to `to` is legal.
    ///
    /// Re-asserting the current status is always allowed (idempotent no-op).
    /// `scraped` only ever moves to `inactive`; a re-listed `inactive`
    /// identifier moves back to `pending`, which forces re-ingest.
    #[must_use]
    pub fn can_transition(&self, to: Self) -> bool {
        match (self, to) {
            (a, b) if *a == b => true,
            (Self::Pending, _) => true,
            (Self::Failed, Self::Pending | Self::Scraped | Self::Inactive) => true,
            (Self::Scraped, Self::Inactive) => true,
            (Self::Inactive, Self::Pending) => true,
            _ => false,
        }
    }

    /// Applies the transition table: returns `proposed` when legal,
    /// otherwise keeps `self`.
    #[must_use]
    pub fn apply(&self, proposed: Self) -> Self {
        if self.can_transition(proposed) {
            proposed
        } else {
            *self
        }
    }
}

impl fmt::Display for ListingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ListingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "scraped" => Ok(Self::Scraped),
            "failed" => Ok(Self::Failed),
            "inactive" => Ok(Self::Inactive),
            _ => Err(format!("invalid listing status: {s}")),
        }
    }
}

/// One row in the `finn_codes` table: a unique listing identifier with
/// its first-sighting timestamp and lifecycle status.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct ListingIdentifier {
    /// Opaque unique key assigned by the source site.
    pub finn_code: String,
    /// RFC 3339 timestamp of first sighting; never updated afterwards.
    pub fetched_at: String,
    /// Current lifecycle status (stored as text, parsed via `status()`).
    pub scrape_status: String,
}

impl ListingIdentifier {
    /// Creates a new identifier row in `pending` status.
    #[must_use]
    pub fn new(finn_code: impl Into<String>, fetched_at: impl Into<String>) -> Self {
        Self {
            finn_code: finn_code.into(),
            fetched_at: fetched_at.into(),
            scrape_status: ListingStatus::Pending.as_str().to_string(),
        }
    }

    /// Returns the parsed status enum.
    ///
    /// Falls back to `Pending` if the stored string is invalid.
    #[must_use]
    pub fn status(&self) -> ListingStatus {
        self.scrape_status.parse().unwrap_or(ListingStatus::Pending)
    }
}

/// Canonical property field names in persisted column order.
///
/// All backends and the CSV exports use exactly this order so that exports
/// from different backends are byte-comparable.
pub const PROPERTY_FIELDS: [&str; 23] = [
    "title",
    "address",
    "asking_price",
    "total_price",
    "costs",
    "joint_debt",
    "monthly_fee",
    "property_type",
    "ownership",
    "bedrooms",
    "internal_area",
    "usable_area",
    "external_usable_area",
    "floor",
    "build_year",
    "rooms",
    "local_area",
    "area_name",
    "image_0",
    "image_1",
    "image_2",
    "latitude",
    "longitude",
];

/// One row in the `properties` table: the structured detail record for a
/// single listing, keyed 1:1 by `finn_code`.
///
/// Fields are flat strings; a field the detail page did not provide holds
/// an empty string, never NULL.
#[derive(Debug, Clone, Default, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct PropertyRecord {
    pub finn_code: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub asking_price: String,
    #[serde(default)]
    pub total_price: String,
    #[serde(default)]
    pub costs: String,
    #[serde(default)]
    pub joint_debt: String,
    #[serde(default)]
    pub monthly_fee: String,
    #[serde(default)]
    pub property_type: String,
    #[serde(default)]
    pub ownership: String,
    #[serde(default)]
    pub bedrooms: String,
    #[serde(default)]
    pub internal_area: String,
    #[serde(default)]
    pub usable_area: String,
    #[serde(default)]
    pub external_usable_area: String,
    #[serde(default)]
    pub floor: String,
    #[serde(default)]
    pub build_year: String,
    #[serde(default)]
    pub rooms: String,
    #[serde(default)]
    pub local_area: String,
    #[serde(default)]
    pub area_name: String,
    #[serde(default)]
    pub image_0: String,
    #[serde(default)]
    pub image_1: String,
    #[serde(default)]
    pub image_2: String,
    #[serde(default)]
    pub latitude: String,
    #[serde(default)]
    pub longitude: String,
    /// Record-level status; mirrors the identifier at write time but is kept
    /// independently so a captured record survives a later `inactive` mark.
    #[serde(default)]
    pub scrape_status: String,
}

impl PropertyRecord {
    /// Builds a record from a parsed field map, filling absent fields with
    /// empty strings.
    #[must_use]
    pub fn from_fields(finn_code: impl Into<String>, fields: &BTreeMap<String, String>) -> Self {
        let get = |name: &str| fields.get(name).cloned().unwrap_or_default();
        Self {
            finn_code: finn_code.into(),
            title: get("title"),
            address: get("address"),
            asking_price: get("asking_price"),
            total_price: get("total_price"),
            costs: get("costs"),
            joint_debt: get("joint_debt"),
            monthly_fee: get("monthly_fee"),
            property_type: get("property_type"),
            ownership: get("ownership"),
            bedrooms: get("bedrooms"),
            internal_area: get("internal_area"),
            usable_area: get("usable_area"),
            external_usable_area: get("external_usable_area"),
            floor: get("floor"),
            build_year: get("build_year"),
            rooms: get("rooms"),
            local_area: get("local_area"),
            area_name: get("area_name"),
            image_0: get("image_0"),
            image_1: get("image_1"),
            image_2: get("image_2"),
            latitude: get("latitude"),
            longitude: get("longitude"),
            scrape_status: ListingStatus::Pending.as_str().to_string(),
        }
    }

    /// Returns the value of a named field, in [`PROPERTY_FIELDS`] vocabulary.
    #[must_use]
    pub fn field(&self, name: &str) -> &str {
        match name {
            "title" => &self.title,
            "address" => &self.address,
            "asking_price" => &self.asking_price,
            "total_price" => &self.total_price,
            "costs" => &self.costs,
            "joint_debt" => &self.joint_debt,
            "monthly_fee" => &self.monthly_fee,
            "property_type" => &self.property_type,
            "ownership" => &self.ownership,
            "bedrooms" => &self.bedrooms,
            "internal_area" => &self.internal_area,
            "usable_area" => &self.usable_area,
            "external_usable_area" => &self.external_usable_area,
            "floor" => &self.floor,
            "build_year" => &self.build_year,
            "rooms" => &self.rooms,
            "local_area" => &self.local_area,
            "area_name" => &self.area_name,
            "image_0" => &self.image_0,
            "image_1" => &self.image_1,
            "image_2" => &self.image_2,
            "latitude" => &self.latitude,
            "longitude" => &self.longitude,
            _ => "",
        }
    }

    /// Returns the parsed record status, defaulting to `Pending`.
    #[must_use]
    pub fn status(&self) -> ListingStatus {
        self.scrape_status.parse().unwrap_or(ListingStatus::Pending)
    }
}

impl fmt::Display for PropertyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PropertyRecord {{ finn_code: {}, title: {}, status: {} }}",
            self.finn_code,
            self.title,
            self.status()
        )
    }
}
