//! The appearance bundle and its component kinds.

use serde::{Deserialize, Serialize};

use crate::hashing::sha256_hex;

/// The transmitted bundle for one player: a list of asset file paths plus a
/// handful of opaque blobs and scalars. Which peer plugin consumes each
/// field is the game layer's business; the engine only moves and stores
/// them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Appearance {
    /// Asset file paths (penumbra).
    pub mod_paths: Vec<String>,
    /// Design blob (glamourer).
    pub glamourer_design: String,
    /// Scaling profile blob (customize+).
    pub customize_scale: String,
    /// Vertical offset (heels).
    pub heels_offset: f32,
    /// Title string (honorific).
    pub honorific_title: String,
    /// Manipulation blob (phonebook).
    pub manipulation_data: String,
}

impl Appearance {
    pub fn is_empty(&self) -> bool {
        self.mod_paths.is_empty()
            && self.glamourer_design.is_empty()
            && self.customize_scale.is_empty()
            && self.heels_offset == 0.0
            && self.honorific_title.is_empty()
            && self.manipulation_data.is_empty()
    }

    /// Fingerprint over every field in declaration order. Two appearances
    /// with equal state hashes are treated as identical by the apply
    /// shortcut.
    pub fn state_hash(&self) -> String {
        let mut buf = Vec::new();
        for path in &self.mod_paths {
            buf.extend_from_slice(path.as_bytes());
            buf.push(0x1f);
        }
        buf.extend_from_slice(self.glamourer_design.as_bytes());
        buf.push(0x1f);
        buf.extend_from_slice(self.customize_scale.as_bytes());
        buf.push(0x1f);
        buf.extend_from_slice(self.heels_offset.to_string().as_bytes());
        buf.push(0x1f);
        buf.extend_from_slice(self.honorific_title.as_bytes());
        buf.push(0x1f);
        buf.extend_from_slice(self.manipulation_data.as_bytes());
        sha256_hex(&buf)
    }
}

/// Component kind — one per appearance field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Penumbra,
    Glamourer,
    CustomizePlus,
    Heels,
    Honorific,
    Phonebook,
}

impl ComponentKind {
    /// Recipe field order. Reconstruction preserves this order.
    pub const ALL: [ComponentKind; 6] = [
        ComponentKind::Penumbra,
        ComponentKind::Glamourer,
        ComponentKind::CustomizePlus,
        ComponentKind::Heels,
        ComponentKind::Honorific,
        ComponentKind::Phonebook,
    ];

    /// Tag used in recipe refs (`"<tag>:<hash>"`).
    pub fn tag(self) -> &'static str {
        match self {
            ComponentKind::Penumbra => "P",
            ComponentKind::Glamourer => "G",
            ComponentKind::CustomizePlus => "C",
            ComponentKind::Heels => "H",
            ComponentKind::Honorific => "O",
            ComponentKind::Phonebook => "PB",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "P" => Some(ComponentKind::Penumbra),
            "G" => Some(ComponentKind::Glamourer),
            "C" => Some(ComponentKind::CustomizePlus),
            "H" => Some(ComponentKind::Heels),
            "O" => Some(ComponentKind::Honorific),
            "PB" => Some(ComponentKind::Phonebook),
            _ => None,
        }
    }
}
