/*!
Memento model: immutable, serializable snapshots of live management objects.

A memento captures an object's identity, its raw configuration and its
relationships to other objects. Relationships are always expressed as ids,
never as embedded objects, so a bundle of mementos can be loaded in any order
and wired afterwards.
*/

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{PersistError, Result};

pub mod codec;
pub mod manifest;
pub mod reference;

pub use codec::{MementoCodec, MEMENTO_FORMAT_VERSION};
pub use manifest::BundleManifest;
pub use reference::ConfigRef;

/// Ordered map of config-key name to raw, unresolved value.
pub type ConfigMap = serde_json::Map<String, Value>;

/// The kinds of object that can be persisted and rebound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObjectKind {
    CatalogItem,
    Location,
    Entity,
    Policy,
    Enricher,
    Feed,
}

impl ObjectKind {
    /// Every kind, in instantiation order. Later kinds may reference earlier
    /// ones but not the reverse.
    pub const ALL: [ObjectKind; 6] = [
        ObjectKind::CatalogItem,
        ObjectKind::Location,
        ObjectKind::Entity,
        ObjectKind::Policy,
        ObjectKind::Enricher,
        ObjectKind::Feed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::CatalogItem => "CATALOG_ITEM",
            ObjectKind::Location => "LOCATION",
            ObjectKind::Entity => "ENTITY",
            ObjectKind::Policy => "POLICY",
            ObjectKind::Enricher => "ENRICHER",
            ObjectKind::Feed => "FEED",
        }
    }

    /// Human readable name used in log and error messages.
    pub fn label(&self) -> &'static str {
        match self {
            ObjectKind::CatalogItem => "catalog item",
            ObjectKind::Location => "location",
            ObjectKind::Entity => "entity",
            ObjectKind::Policy => "policy",
            ObjectKind::Enricher => "enricher",
            ObjectKind::Feed => "feed",
        }
    }

    /// Name of the store namespace (directory or key prefix) for this kind.
    pub fn dir_name(&self) -> &'static str {
        match self {
            ObjectKind::CatalogItem => "catalog",
            ObjectKind::Location => "locations",
            ObjectKind::Entity => "entities",
            ObjectKind::Policy => "policies",
            ObjectKind::Enricher => "enrichers",
            ObjectKind::Feed => "feeds",
        }
    }

    pub fn from_dir_name(name: &str) -> Option<ObjectKind> {
        ObjectKind::ALL.into_iter().find(|kind| kind.dir_name() == name)
    }

    /// Policies, enrichers and feeds are attached to an owning entity.
    pub fn is_adjunct(&self) -> bool {
        matches!(
            self,
            ObjectKind::Policy | ObjectKind::Enricher | ObjectKind::Feed
        )
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ObjectKind {
    type Err = PersistError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_uppercase().replace([' ', '-'], "_");
        ObjectKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .or_else(|| ObjectKind::from_dir_name(&s.trim().to_ascii_lowercase()))
            .ok_or_else(|| PersistError::validation(format!("Unknown object kind: {s}")))
    }
}

/// Fields shared by every memento.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MementoHeader {
    pub id: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_item_id: Option<String>,
    #[serde(default)]
    pub config: ConfigMap,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl MementoHeader {
    pub fn new(id: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            type_name: type_name.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EntityMemento {
    #[serde(flatten)]
    pub header: MementoHeader,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub children_ids: Vec<String>,
    #[serde(default)]
    pub members_ids: BTreeSet<String>,
    #[serde(default)]
    pub location_ids: Vec<String>,
    #[serde(default)]
    pub policy_ids: Vec<String>,
    #[serde(default)]
    pub enricher_ids: Vec<String>,
    #[serde(default)]
    pub feed_ids: Vec<String>,
    /// Last published sensor values.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub attributes: ConfigMap,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LocationMemento {
    #[serde(flatten)]
    pub header: MementoHeader,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub children_ids: Vec<String>,
}

/// Memento for a policy, enricher or feed. The owning entity is implicit: it
/// is whichever entity lists this id.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AdjunctMemento {
    #[serde(flatten)]
    pub header: MementoHeader,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CatalogItemMemento {
    #[serde(flatten)]
    pub header: MementoHeader,
    pub symbolic_name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_yaml: Option<String>,
    #[serde(default)]
    pub libraries: Vec<String>,
    #[serde(default)]
    pub deprecated: bool,
    #[serde(default)]
    pub disabled: bool,
}

/// A memento of any kind. The kind is carried by the blob envelope and the
/// store namespace rather than by a tag in the memento body.
#[derive(Debug, Clone, PartialEq)]
pub enum Memento {
    CatalogItem(CatalogItemMemento),
    Location(LocationMemento),
    Entity(EntityMemento),
    Policy(AdjunctMemento),
    Enricher(AdjunctMemento),
    Feed(AdjunctMemento),
}

impl Memento {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Memento::CatalogItem(_) => ObjectKind::CatalogItem,
            Memento::Location(_) => ObjectKind::Location,
            Memento::Entity(_) => ObjectKind::Entity,
            Memento::Policy(_) => ObjectKind::Policy,
            Memento::Enricher(_) => ObjectKind::Enricher,
            Memento::Feed(_) => ObjectKind::Feed,
        }
    }

    pub fn header(&self) -> &MementoHeader {
        match self {
            Memento::CatalogItem(m) => &m.header,
            Memento::Location(m) => &m.header,
            Memento::Entity(m) => &m.header,
            Memento::Policy(m) | Memento::Enricher(m) | Memento::Feed(m) => &m.header,
        }
    }

    pub fn id(&self) -> &str {
        &self.header().id
    }

    pub fn type_name(&self) -> &str {
        &self.header().type_name
    }

    /// Wrap an adjunct memento under the given adjunct kind.
    pub fn adjunct(kind: ObjectKind, memento: AdjunctMemento) -> Result<Memento> {
        match kind {
            ObjectKind::Policy => Ok(Memento::Policy(memento)),
            ObjectKind::Enricher => Ok(Memento::Enricher(memento)),
            ObjectKind::Feed => Ok(Memento::Feed(memento)),
            other => Err(PersistError::validation(format!(
                "{other} is not an adjunct kind"
            ))),
        }
    }

    /// The memento body as JSON, without the envelope.
    pub fn to_value(&self) -> Result<Value> {
        let value = match self {
            Memento::CatalogItem(m) => serde_json::to_value(m)?,
            Memento::Location(m) => serde_json::to_value(m)?,
            Memento::Entity(m) => serde_json::to_value(m)?,
            Memento::Policy(m) | Memento::Enricher(m) | Memento::Feed(m) => {
                serde_json::to_value(m)?
            }
        };
        Ok(value)
    }

    pub(crate) fn from_value(kind: ObjectKind, value: Value) -> Result<Memento> {
        let memento = match kind {
            ObjectKind::CatalogItem => Memento::CatalogItem(serde_json::from_value(value)?),
            ObjectKind::Location => Memento::Location(serde_json::from_value(value)?),
            ObjectKind::Entity => Memento::Entity(serde_json::from_value(value)?),
            ObjectKind::Policy => Memento::Policy(serde_json::from_value(value)?),
            ObjectKind::Enricher => Memento::Enricher(serde_json::from_value(value)?),
            ObjectKind::Feed => Memento::Feed(serde_json::from_value(value)?),
        };
        Ok(memento)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_names_round_trip() {
        for kind in ObjectKind::ALL {
            assert_eq!(kind.as_str().parse::<ObjectKind>().unwrap(), kind);
            assert_eq!(kind.dir_name().parse::<ObjectKind>().unwrap(), kind);
            assert_eq!(ObjectKind::from_dir_name(kind.dir_name()), Some(kind));
        }
        assert_eq!("catalog item".parse::<ObjectKind>().unwrap(), ObjectKind::CatalogItem);
        assert!("widget".parse::<ObjectKind>().is_err());
    }

    #[test]
    fn test_kind_serializes_screaming_case() {
        let value = serde_json::to_value(ObjectKind::CatalogItem).unwrap();
        assert_eq!(value, json!("CATALOG_ITEM"));
    }

    #[test]
    fn test_tier_order() {
        let position = |k| ObjectKind::ALL.iter().position(|x| *x == k).unwrap();
        assert!(position(ObjectKind::CatalogItem) < position(ObjectKind::Location));
        assert!(position(ObjectKind::Location) < position(ObjectKind::Entity));
        assert!(position(ObjectKind::Entity) < position(ObjectKind::Policy));
    }

    #[test]
    fn test_entity_memento_flattens_header() {
        let mut memento = EntityMemento {
            header: MementoHeader::new("e1", "web.Server"),
            parent_id: Some("app".to_string()),
            ..Default::default()
        };
        memento.header.config.insert("port".to_string(), json!(8080));

        let value = Memento::Entity(memento.clone()).to_value().unwrap();
        assert_eq!(value["id"], json!("e1"));
        assert_eq!(value["type"], json!("web.Server"));
        assert_eq!(value["config"]["port"], json!(8080));

        let back = Memento::from_value(ObjectKind::Entity, value).unwrap();
        assert_eq!(back, Memento::Entity(memento));
    }

    #[test]
    fn test_adjunct_rejects_non_adjunct_kind() {
        let memento = AdjunctMemento::default();
        assert!(Memento::adjunct(ObjectKind::Entity, memento.clone()).is_err());
        assert_eq!(
            Memento::adjunct(ObjectKind::Feed, memento).unwrap().kind(),
            ObjectKind::Feed
        );
    }
}
