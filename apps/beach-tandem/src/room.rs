use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Cluster-wide unique connection identifier.
pub type ConnectionId = String;

/// Hex room token derived from the record a room edits.
pub type RoomId = String;

/// Palette handed out to participants so cursors can be told apart.
pub const COLORS: [&str; 10] = [
    "purple", "blue", "green", "yellow", "orange", "red", "pink", "teal", "gray", "brown",
];

/// The record a room edits. Singletons have no item key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomKey {
    pub collection: String,
    pub item: Option<String>,
    pub version: Option<String>,
}

impl RoomKey {
    pub fn new(collection: impl Into<String>, item: Option<String>, version: Option<String>) -> Self {
        Self {
            collection: collection.into(),
            item,
            version,
        }
    }

    /// Every node derives the same token for the same record.
    pub fn room_id(&self) -> RoomId {
        let joined = [
            self.collection.as_str(),
            self.item.as_deref().unwrap_or(""),
            self.version.as_deref().unwrap_or(""),
        ]
        .join("-");
        let mut hasher = Sha256::new();
        hasher.update(joined.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn display_name(&self) -> String {
        [
            Some(self.collection.as_str()),
            self.item.as_deref(),
            self.version.as_deref(),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(":")
    }

    /// A save of `(collection, item, version)` concerns this room.
    pub fn matches_save(&self, collection: &str, item: Option<&str>, version: Option<&str>) -> bool {
        self.collection == collection
            && (self.item.is_none() || self.item.as_deref() == item)
            && self.version.as_deref() == version
    }

    /// Deleting `(collection, item)` ends every room on the item, whatever its version.
    pub fn matches_delete(&self, collection: &str, item: Option<&str>) -> bool {
        self.collection == collection && (self.item.is_none() || self.item.as_deref() == item)
    }
}

/// Room metadata as kept in the shared store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMeta {
    pub room: RoomId,
    #[serde(flatten)]
    pub key: RoomKey,
}

impl RoomMeta {
    pub fn new(key: RoomKey) -> Self {
        Self {
            room: key.room_id(),
            key,
        }
    }
}

/// Colours to try, best first: the requested one when it is on the palette, then the rest shuffled.
pub fn color_preference(requested: Option<&str>) -> Vec<String> {
    let mut rest: Vec<&str> = COLORS
        .iter()
        .copied()
        .filter(|color| Some(*color) != requested)
        .collect();
    rest.shuffle(&mut rand::thread_rng());

    let mut preference = Vec::with_capacity(COLORS.len());
    if let Some(color) = requested.filter(|color| COLORS.contains(color)) {
        preference.push(color.to_string());
    }
    preference.extend(rest.into_iter().map(str::to_string));
    preference
}

/// First preferred colour nobody holds; the palette wraps once exhausted.
pub fn pick_color<'a>(preference: &'a [String], taken: &[&str]) -> Option<&'a String> {
    preference
        .iter()
        .find(|color| !taken.contains(&color.as_str()))
        .or_else(|| preference.first())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn room_id_is_stable_and_version_sensitive() {
        let base = RoomKey::new("articles", Some("42".into()), None);
        let again = RoomKey::new("articles", Some("42".into()), None);
        let versioned = RoomKey::new("articles", Some("42".into()), Some("draft".into()));

        assert_eq!(base.room_id(), again.room_id());
        assert_ne!(base.room_id(), versioned.room_id());
        assert_eq!(base.room_id().len(), 64);
    }

    #[test_timeout::timeout]
    fn display_name_skips_missing_parts() {
        assert_eq!(RoomKey::new("settings", None, None).display_name(), "settings");
        assert_eq!(
            RoomKey::new("articles", Some("7".into()), Some("v1".into())).display_name(),
            "articles:7:v1"
        );
    }

    #[test_timeout::timeout]
    fn save_matching_respects_version() {
        let plain = RoomKey::new("articles", Some("7".into()), None);
        let draft = RoomKey::new("articles", Some("7".into()), Some("v1".into()));
        assert!(plain.matches_save("articles", Some("7"), None));
        assert!(!plain.matches_save("articles", Some("8"), None));
        assert!(!draft.matches_save("articles", Some("7"), None));
        assert!(draft.matches_save("articles", Some("7"), Some("v1")));
        assert!(draft.matches_delete("articles", Some("7")));
    }

    #[test_timeout::timeout]
    fn requested_color_wins_when_free() {
        let preference = color_preference(Some("teal"));
        assert_eq!(preference[0], "teal");
        assert_eq!(preference.len(), COLORS.len());
        assert_eq!(pick_color(&preference, &["blue"]).unwrap(), "teal");
        assert_ne!(pick_color(&preference, &["teal"]).unwrap(), "teal");
    }

    #[test_timeout::timeout]
    fn unknown_color_request_is_ignored() {
        let preference = color_preference(Some("chartreuse"));
        assert_eq!(preference.len(), COLORS.len());
        assert!(!preference.iter().any(|color| color == "chartreuse"));
    }

    #[test_timeout::timeout]
    fn palette_wraps_when_exhausted() {
        let preference = color_preference(None);
        let taken: Vec<&str> = COLORS.to_vec();
        assert_eq!(pick_color(&preference, &taken), preference.first());
    }
}
