//! The entity kinds held in synced collections.
//!
//! | entity            | collection            | id                  |
//! |-------------------|-----------------------|---------------------|
//! | `AssignedDataItem`| `assigneddb`          | postcode            |
//! | `GroupDataItem`   | `groupdatadb`         | group id ("0" reserved) |
//! | `RoundDataItem`   | `rounddb_{group}`     | round id ("0" reserved) |
//! | `SortBoxItem`     | `sortboxdb_{group}`   | sort-box id ("0" reserved) |
//! | `SortDataItem`    | `groupdb_{group}`     | postcode            |
//! | `StreetInfoItem`  | `streetinfodb`        | postcode            |
//! | `LabelData`       | `labeldb`             | postcode            |
//! | `PolygonDataItem` | `polygondb`           | polygon id          |
//! | `PostboxItem`     | `postboxdb`           | postbox id          |
//! | `UserRecord`      | `_users`              | `org.couchdb.user:{name}` |

use std::fmt;

use mailround_sync_macros::Document;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

use crate::document::UNASSIGNED;

/// A map coordinate.
///
/// Serialized as `{"lat": .., "lng": ..}`; also read from `[lat, lng]` pairs.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

impl<'de> Deserialize<'de> for LatLng {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Object { lat: f64, lng: f64 },
            Pair(f64, f64),
        }

        match Repr::deserialize(deserializer) {
            Ok(Repr::Object { lat, lng }) | Ok(Repr::Pair(lat, lng)) => Ok(LatLng { lat, lng }),
            Err(_) => Err(de::Error::custom(
                "expected {\"lat\", \"lng\"} or a [lat, lng] pair",
            )),
        }
    }
}

/// Which group a street belongs to, and optionally its sort box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Document)]
#[document(collection = "assigneddb")]
pub struct AssignedDataItem {
    /// Postcode.
    #[serde(rename = "_id")]
    pub id: String,
    /// Group id; `"0"` when unassigned.
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sortbox: Option<String>,
}

impl AssignedDataItem {
    pub fn new(postcode: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            id: postcode.into(),
            key: group.into(),
            sortbox: None,
        }
    }

    pub fn is_assigned(&self) -> bool {
        self.key != UNASSIGNED
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Document)]
#[document(collection = "groupdatadb", guards_unassigned)]
pub struct GroupDataItem {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default, rename = "contactDetails")]
    pub contact_details: String,
    #[serde(default)]
    pub colour: String,
}

impl GroupDataItem {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            notes: String::new(),
            contact_details: String::new(),
            colour: String::new(),
        }
    }

    pub fn with_colour(mut self, colour: impl Into<String>) -> Self {
        self.colour = colour.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Document)]
#[document(collection = "rounddb_", group_scoped, guards_unassigned)]
pub struct RoundDataItem {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub notes: String,
}

impl RoundDataItem {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            notes: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Document)]
#[document(collection = "sortboxdb_", group_scoped, guards_unassigned)]
pub struct SortBoxItem {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
}

impl SortBoxItem {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Per-street delivery ordering within a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Document)]
#[document(collection = "groupdb_", group_scoped)]
pub struct SortDataItem {
    /// Postcode.
    #[serde(rename = "_id")]
    pub id: String,
    /// Round id; `"0"` when unassigned.
    #[serde(default = "unassigned")]
    pub round: String,
    /// Sort-box id; `"0"` when unassigned.
    #[serde(default = "unassigned")]
    pub sortbox: String,
    /// Position within the round.
    #[serde(default)]
    pub order: u32,
}

impl SortDataItem {
    pub fn new(postcode: impl Into<String>, round: impl Into<String>) -> Self {
        Self {
            id: postcode.into(),
            round: round.into(),
            sortbox: unassigned(),
            order: 0,
        }
    }
}

fn unassigned() -> String {
    UNASSIGNED.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Document)]
#[document(collection = "streetinfodb")]
pub struct StreetInfoItem {
    /// Postcode.
    #[serde(rename = "_id")]
    pub id: String,
    pub street: String,
    #[serde(default)]
    pub locality: String,
    /// Number of delivery points.
    #[serde(default)]
    pub properties: u32,
}

impl StreetInfoItem {
    pub fn new(postcode: impl Into<String>, street: impl Into<String>) -> Self {
        Self {
            id: postcode.into(),
            street: street.into(),
            locality: String::new(),
            properties: 0,
        }
    }
}

/// A text label drawn on the map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub text: String,
    pub pos: LatLng,
    #[serde(default)]
    pub rotation: f64,
}

/// Every label drawn for one street.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Document)]
#[document(collection = "labeldb")]
pub struct LabelData {
    /// Postcode.
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub labels: Vec<Label>,
}

impl LabelData {
    /// Label addressed by a `"{postcode}:{index}"` key, if it belongs here.
    pub fn label(&self, key: &str) -> Option<&Label> {
        let (postcode, index) = parse_label_key(key)?;
        if postcode != self.id {
            return None;
        }
        self.labels.get(index)
    }

    /// Keys of every label on this street, in index order.
    pub fn label_keys(&self) -> Vec<String> {
        (0..self.labels.len())
            .map(|index| label_key(&self.id, index))
            .collect()
    }
}

/// Composite key addressing one label of a street.
pub fn label_key(postcode: &str, index: usize) -> String {
    format!("{}:{}", postcode, index)
}

/// Split a label key into postcode and index. The postcode may itself contain
/// colons; the index is whatever follows the last one.
pub fn parse_label_key(key: &str) -> Option<(&str, usize)> {
    let (postcode, index) = key.rsplit_once(':')?;
    if postcode.is_empty() {
        return None;
    }
    Some((postcode, index.parse().ok()?))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Document)]
#[document(collection = "polygondb")]
pub struct PolygonDataItem {
    #[serde(rename = "_id")]
    pub id: String,
    /// Anchor point, used to place the polygon's caption.
    pub pos: LatLng,
    #[serde(default)]
    pub polygon: Vec<LatLng>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Document)]
#[document(collection = "postboxdb")]
pub struct PostboxItem {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    pub pos: LatLng,
    /// Last collection time, as printed on the box.
    #[serde(default, rename = "collectionTime", skip_serializing_if = "Option::is_none")]
    pub collection_time: Option<String>,
}

/// An account in the remote `_users` database. Read-only to this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Document)]
#[document(collection = "_users")]
pub struct UserRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default, rename = "groupId", skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
}

impl UserRecord {
    pub const ID_PREFIX: &'static str = "org.couchdb.user:";

    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: format!("{}{}", Self::ID_PREFIX, name),
            name,
            roles: Vec::new(),
            group_id: None,
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(|role| role == "admin" || role == "_admin")
    }
}

impl fmt::Display for UserRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
