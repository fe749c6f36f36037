//! Component and recipe store.
//!
//! Two directories under the storage root: `components/` holds one JSON
//! file per component keyed by hash, `recipes/` one JSON file per
//! `<player>_<appearance_hash>.json`. In-memory maps mirror disk for O(1)
//! lookup; misses fall back to disk and warm the map.
//!
//! `store_component` is idempotent: the same (kind, identifier, data)
//! triple always yields the same hash, and re-storing bumps the reference
//! count instead of duplicating the payload.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use attune_core::hashing::component_hash;
use attune_core::{Appearance, ComponentKind};

use crate::types::{recipe_key, Component, DedupStats, Recipe, StoreStats};

const MANIFEST_FILE: &str = "component_manifest.json";

/// Snapshot written on graceful shutdown and read back on startup to warm
/// the in-memory maps.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreManifest {
    written_at: Option<DateTime<Utc>>,
    component_hashes: Vec<String>,
    recipe_keys: Vec<String>,
}

pub struct ComponentStore {
    root: PathBuf,
    components_dir: PathBuf,
    recipes_dir: PathBuf,
    components: DashMap<String, Component>,
    recipes: DashMap<String, Recipe>,
}

impl ComponentStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let components_dir = root.join("components");
        let recipes_dir = root.join("recipes");
        fs::create_dir_all(&components_dir)
            .with_context(|| format!("failed to create {}", components_dir.display()))?;
        fs::create_dir_all(&recipes_dir)
            .with_context(|| format!("failed to create {}", recipes_dir.display()))?;

        let store = Self {
            root,
            components_dir,
            recipes_dir,
            components: DashMap::new(),
            recipes: DashMap::new(),
        };
        store.warm_from_manifest();
        Ok(store)
    }

    /// Persist every non-empty field of `appearance` as a component and
    /// write the recipe tying them together. Returns the recipe key
    /// `"<player>:<appearance_hash>"`.
    pub fn store_recipe(
        &self,
        player_name: &str,
        appearance_hash: &str,
        appearance: &Appearance,
    ) -> Result<String> {
        let mut refs = Vec::new();
        for kind in ComponentKind::ALL {
            let Some((identifier, data)) = component_fields(kind, appearance) else {
                continue;
            };
            let hash = self.store_component(kind, identifier, Some(&data))?;
            refs.push(format!("{}:{hash}", kind.tag()));
        }

        let now = Utc::now();
        let recipe = Recipe {
            appearance_hash: appearance_hash.to_string(),
            player_name: player_name.to_string(),
            created_at: now,
            last_accessed_at: now,
            refs,
        };
        write_json(&self.recipes_dir.join(recipe.file_name()), &recipe)?;
        let key = recipe.key();
        self.recipes.insert(key.clone(), recipe);

        tracing::debug!(player = player_name, hash = appearance_hash, "recipe stored");
        Ok(key)
    }

    /// Store one component, deduplicating on its canonical hash.
    pub fn store_component(
        &self,
        kind: ComponentKind,
        identifier: &str,
        data: Option<&str>,
    ) -> Result<String> {
        let data = data.unwrap_or("");
        let hash = component_hash(identifier, data);

        if let Some(mut existing) = self.components.get_mut(&hash) {
            existing.reference_count += 1;
            existing.last_accessed_at = Utc::now();
            write_json(&self.component_path(&hash), existing.value())?;
            return Ok(hash);
        }
        if let Some(mut on_disk) = self.load_component(&hash) {
            on_disk.reference_count += 1;
            on_disk.last_accessed_at = Utc::now();
            write_json(&self.component_path(&hash), &on_disk)?;
            self.components.insert(hash.clone(), on_disk);
            return Ok(hash);
        }

        let now = Utc::now();
        let payload_len = if data.is_empty() { identifier.len() } else { data.len() };
        let component = Component {
            hash: hash.clone(),
            kind,
            identifier: identifier.to_string(),
            data: data.to_string(),
            size: payload_len as u64,
            created_at: now,
            last_accessed_at: now,
            reference_count: 1,
        };
        write_json(&self.component_path(&hash), &component)?;
        self.components.insert(hash.clone(), component);
        Ok(hash)
    }

    /// Load a recipe, memory first, disk as fallback.
    pub fn get_recipe(&self, player_name: &str, appearance_hash: &str) -> Option<Recipe> {
        let key = recipe_key(player_name, appearance_hash);
        if let Some(recipe) = self.recipes.get(&key) {
            return Some(recipe.clone());
        }
        let file = self.recipes_dir.join(format!("{}.json", key.replace(':', "_")));
        let loaded: Recipe = read_json(&file)?;
        self.recipes.insert(key, loaded.clone());
        Some(loaded)
    }

    /// Reconstruct an appearance from its recipe. Unknown ref tags are
    /// ignored; refs whose component fails to load are skipped.
    pub fn get_appearance(&self, player_name: &str, appearance_hash: &str) -> Option<Appearance> {
        let key = recipe_key(player_name, appearance_hash);
        let recipe = self.get_recipe(player_name, appearance_hash)?;

        let mut appearance = Appearance::default();
        for tagged in &recipe.refs {
            let Some((tag, hash)) = tagged.split_once(':') else {
                tracing::warn!(reference = %tagged, "malformed recipe ref, skipping");
                continue;
            };
            let Some(kind) = ComponentKind::from_tag(tag) else {
                continue;
            };
            let Some(component) = self.get_component(hash) else {
                tracing::warn!(hash, tag, "recipe ref resolves to no component, skipping");
                continue;
            };
            apply_component(&mut appearance, kind, &component.data);
        }

        if let Some(mut entry) = self.recipes.get_mut(&key) {
            entry.last_accessed_at = Utc::now();
        }
        Some(appearance)
    }

    /// Most recently accessed recipe for a player, falling back to the
    /// newest on-disk `<player>_*.json`.
    pub fn get_latest_recipe(&self, player_name: &str) -> Option<Recipe> {
        let in_memory = self
            .recipes
            .iter()
            .filter(|r| r.player_name == player_name)
            .max_by_key(|r| r.last_accessed_at)
            .map(|r| r.clone());
        if in_memory.is_some() {
            return in_memory;
        }

        let prefix = format!("{}_", player_name.replace(':', "_"));
        let mut newest: Option<(DateTime<Utc>, Recipe)> = None;
        for file in fs::read_dir(&self.recipes_dir).ok()?.flatten() {
            let name = file.file_name().to_string_lossy().into_owned();
            if !name.starts_with(&prefix) || !name.ends_with(".json") {
                continue;
            }
            let modified = file
                .metadata()
                .and_then(|m| m.modified())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            if newest.as_ref().is_some_and(|(t, _)| *t >= modified) {
                continue;
            }
            if let Some(recipe) = read_json::<Recipe>(&file.path()) {
                newest = Some((modified, recipe));
            }
        }
        let recipe = newest.map(|(_, r)| r)?;
        self.recipes.insert(recipe.key(), recipe.clone());
        Some(recipe)
    }

    /// Take in a component received whole from a peer. Reuses the existing
    /// record (bumping its reference count) when the hash is already known.
    pub fn adopt_component(&self, component: Component) -> Result<String> {
        if self.has_component(&component.hash) {
            return self.store_component(
                component.kind,
                &component.identifier,
                Some(&component.data),
            );
        }
        let hash = component.hash.clone();
        write_json(&self.component_path(&hash), &component)?;
        self.components.insert(hash.clone(), component);
        Ok(hash)
    }

    pub fn get_component(&self, hash: &str) -> Option<Component> {
        if let Some(component) = self.components.get(hash) {
            return Some(component.clone());
        }
        let component = self.load_component(hash)?;
        self.components.insert(hash.to_string(), component.clone());
        Some(component)
    }

    pub fn has_component(&self, hash: &str) -> bool {
        self.components.contains_key(hash) || self.component_path(hash).exists()
    }

    pub fn clear_all(&self) -> Result<()> {
        self.components.clear();
        self.recipes.clear();
        for dir in [&self.components_dir, &self.recipes_dir] {
            for file in fs::read_dir(dir)
                .with_context(|| format!("failed to list {}", dir.display()))?
                .flatten()
            {
                let _ = fs::remove_file(file.path());
            }
        }
        let _ = fs::remove_file(self.root.join(MANIFEST_FILE));
        Ok(())
    }

    pub fn stats(&self) -> StoreStats {
        let mut stats = StoreStats {
            components: self.components.len(),
            recipes: self.recipes.len(),
            ..Default::default()
        };
        for component in self.components.iter() {
            stats.component_bytes += component.size;
            stats.total_references += component.reference_count;
        }
        stats
    }

    pub fn dedup_stats(&self) -> DedupStats {
        let mut stats = DedupStats {
            unique_components: self.components.len(),
            ..Default::default()
        };
        for component in self.components.iter() {
            stats.total_references += component.reference_count;
            stats.bytes_saved += component.size * (component.reference_count - 1);
        }
        stats
    }

    /// Drop components whose last access is older than the cutoff.
    /// Recipes are never swept.
    pub fn sweep_components(&self, max_age_hours: u64) -> usize {
        if max_age_hours == 0 {
            return 0;
        }
        let cutoff = Utc::now() - chrono::Duration::hours(max_age_hours as i64);
        let expired: Vec<String> = self
            .components
            .iter()
            .filter(|c| c.last_accessed_at < cutoff)
            .map(|c| c.hash.clone())
            .collect();
        let removed = expired.len();
        for hash in expired {
            self.components.remove(&hash);
            let _ = fs::remove_file(self.component_path(&hash));
        }
        if removed > 0 {
            tracing::info!(removed, "component sweep");
        }
        removed
    }

    /// Write the manifest snapshot. Called on graceful shutdown.
    pub fn shutdown(&self) -> Result<()> {
        let manifest = StoreManifest {
            written_at: Some(Utc::now()),
            component_hashes: self.components.iter().map(|c| c.hash.clone()).collect(),
            recipe_keys: self.recipes.iter().map(|r| r.value().key()).collect(),
        };
        write_json(&self.root.join(MANIFEST_FILE), &manifest)
    }

    fn warm_from_manifest(&self) {
        let Some(manifest) = read_json::<StoreManifest>(&self.root.join(MANIFEST_FILE)) else {
            return;
        };
        for hash in &manifest.component_hashes {
            if let Some(component) = self.load_component(hash) {
                self.components.insert(hash.clone(), component);
            }
        }
        for key in &manifest.recipe_keys {
            let file = self.recipes_dir.join(format!("{}.json", key.replace(':', "_")));
            if let Some(recipe) = read_json::<Recipe>(&file) {
                self.recipes.insert(key.clone(), recipe);
            }
        }
        tracing::debug!(
            components = self.components.len(),
            recipes = self.recipes.len(),
            "store warmed from manifest"
        );
    }

    fn load_component(&self, hash: &str) -> Option<Component> {
        read_json(&self.component_path(hash))
    }

    fn component_path(&self, hash: &str) -> PathBuf {
        self.components_dir.join(format!("{hash}.json"))
    }
}

/// Map one appearance field to its component (identifier, data), or `None`
/// when the field is empty.
fn component_fields(kind: ComponentKind, appearance: &Appearance) -> Option<(&'static str, String)> {
    match kind {
        ComponentKind::Penumbra => (!appearance.mod_paths.is_empty()).then(|| {
            (
                "mods",
                serde_json::to_string(&appearance.mod_paths).unwrap_or_default(),
            )
        }),
        ComponentKind::Glamourer => (!appearance.glamourer_design.is_empty())
            .then(|| ("design", appearance.glamourer_design.clone())),
        ComponentKind::CustomizePlus => (!appearance.customize_scale.is_empty())
            .then(|| ("scale", appearance.customize_scale.clone())),
        ComponentKind::Heels => {
            (appearance.heels_offset != 0.0).then(|| ("offset", appearance.heels_offset.to_string()))
        }
        ComponentKind::Honorific => (!appearance.honorific_title.is_empty())
            .then(|| ("title", appearance.honorific_title.clone())),
        ComponentKind::Phonebook => (!appearance.manipulation_data.is_empty())
            .then(|| ("manipulation", appearance.manipulation_data.clone())),
    }
}

/// Inverse of [`component_fields`]: pour component data back into the
/// appearance. Unparseable payloads leave the field untouched.
fn apply_component(appearance: &mut Appearance, kind: ComponentKind, data: &str) {
    match kind {
        ComponentKind::Penumbra => match serde_json::from_str(data) {
            Ok(paths) => appearance.mod_paths = paths,
            Err(e) => tracing::warn!(error = %e, "mod path list failed to parse, skipping"),
        },
        ComponentKind::Glamourer => appearance.glamourer_design = data.to_string(),
        ComponentKind::CustomizePlus => appearance.customize_scale = data.to_string(),
        ComponentKind::Heels => match data.parse() {
            Ok(offset) => appearance.heels_offset = offset,
            Err(e) => tracing::warn!(error = %e, "heel offset failed to parse, skipping"),
        },
        ComponentKind::Honorific => appearance.honorific_title = data.to_string(),
        ComponentKind::Phonebook => appearance.manipulation_data = data.to_string(),
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
    let text = serde_json::to_vec_pretty(value).context("failed to serialize record")?;
    fs::write(&tmp, text).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to rename {} to {}", tmp.display(), path.display()))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Option<T> {
    let text = fs::read(path).ok()?;
    match serde_json::from_slice(&text) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "corrupt store record, ignoring");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, ComponentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ComponentStore::new(dir.path().join("ComponentStorage")).unwrap();
        (dir, store)
    }

    fn hero_appearance() -> Appearance {
        Appearance {
            mod_paths: vec!["chest.mdl".into(), "skin.tex".into()],
            glamourer_design: "design-blob".into(),
            customize_scale: String::new(),
            heels_offset: 0.05,
            honorific_title: "Hero".into(),
            manipulation_data: "manip-blob".into(),
        }
    }

    #[test]
    fn store_component_is_idempotent() {
        let (_dir, store) = store();
        let first = store
            .store_component(ComponentKind::Honorific, "title", Some("Hero"))
            .unwrap();
        let second = store
            .store_component(ComponentKind::Honorific, "title", Some("Hero"))
            .unwrap();
        assert_eq!(first, second);

        let component = store.get_component(&first).unwrap();
        assert_eq!(component.reference_count, 2);
        assert_eq!(component.data, "Hero");
    }

    #[test]
    fn recipe_round_trips_appearance() {
        let (_dir, store) = store();
        let appearance = hero_appearance();
        let key = store
            .store_recipe("Aila Swift", "HASH1", &appearance)
            .unwrap();
        assert_eq!(key, "Aila Swift:HASH1");

        let rebuilt = store.get_appearance("Aila Swift", "HASH1").unwrap();
        assert_eq!(rebuilt, appearance);
    }

    #[test]
    fn recipe_skips_empty_fields() {
        let (_dir, store) = store();
        let appearance = Appearance {
            honorific_title: "Hero".into(),
            ..Default::default()
        };
        store.store_recipe("Aila Swift", "H", &appearance).unwrap();

        let recipe = store.get_latest_recipe("Aila Swift").unwrap();
        assert_eq!(recipe.refs.len(), 1);
        assert!(recipe.refs[0].starts_with("O:"), "ref was {:?}", recipe.refs);
    }

    #[test]
    fn recipes_survive_restart_via_disk() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("ComponentStorage");
        let appearance = hero_appearance();
        {
            let store = ComponentStore::new(&root).unwrap();
            store.store_recipe("Aila Swift", "H2", &appearance).unwrap();
        }
        let reopened = ComponentStore::new(&root).unwrap();
        assert_eq!(reopened.get_appearance("Aila Swift", "H2").unwrap(), appearance);
    }

    #[test]
    fn unknown_tags_and_missing_components_are_skipped() {
        let (_dir, store) = store();
        let recipe = Recipe {
            appearance_hash: "H3".into(),
            player_name: "Aila Swift".into(),
            created_at: Utc::now(),
            last_accessed_at: Utc::now(),
            refs: vec![
                "Z:0000000000000000".into(),
                "O:FFFFFFFFFFFFFFFF".into(),
                "garbage".into(),
            ],
        };
        write_json(
            &store.recipes_dir.join(recipe.file_name()),
            &recipe,
        )
        .unwrap();

        let appearance = store.get_appearance("Aila Swift", "H3").unwrap();
        assert_eq!(appearance, Appearance::default());
    }

    #[test]
    fn latest_recipe_prefers_most_recent_access() {
        let (_dir, store) = store();
        store
            .store_recipe("Aila Swift", "OLD", &hero_appearance())
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        store
            .store_recipe("Aila Swift", "NEW", &hero_appearance())
            .unwrap();

        let latest = store.get_latest_recipe("Aila Swift").unwrap();
        assert_eq!(latest.appearance_hash, "NEW");
    }

    #[test]
    fn dedup_stats_count_saved_bytes() {
        let (_dir, store) = store();
        store
            .store_component(ComponentKind::Glamourer, "design", Some("0123456789"))
            .unwrap();
        store
            .store_component(ComponentKind::Glamourer, "design", Some("0123456789"))
            .unwrap();
        store
            .store_component(ComponentKind::Glamourer, "design", Some("0123456789"))
            .unwrap();

        let dedup = store.dedup_stats();
        assert_eq!(dedup.unique_components, 1);
        assert_eq!(dedup.total_references, 3);
        assert_eq!(dedup.bytes_saved, 20);
    }

    #[test]
    fn manifest_warms_maps_on_startup() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("ComponentStorage");
        {
            let store = ComponentStore::new(&root).unwrap();
            store
                .store_recipe("Aila Swift", "WARM", &hero_appearance())
                .unwrap();
            store.shutdown().unwrap();
        }
        let reopened = ComponentStore::new(&root).unwrap();
        let stats = reopened.stats();
        assert!(stats.components > 0, "manifest warm-load should populate components");
        assert_eq!(stats.recipes, 1);
    }

    #[test]
    fn clear_all_empties_store() {
        let (_dir, store) = store();
        store
            .store_recipe("Aila Swift", "H", &hero_appearance())
            .unwrap();
        store.clear_all().unwrap();
        assert_eq!(store.stats(), StoreStats::default());
        assert!(store.get_appearance("Aila Swift", "H").is_none());
    }
}
