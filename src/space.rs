//! Per-tenant space registry. A space is a logical topic bucket; every
//! document lands in exactly one per tenant, with a `"general"` fallback
//! that always exists. Registries persist as one JSON file per tenant.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::text::tokenize;

pub const GENERAL_SPACE_ID: &str = "general";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpaceStatus {
    Active,
    Archived,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Space {
    pub space_id: String,
    pub tenant_id: String,
    pub name: String,
    pub authority_score: f32,
    pub auto_created: bool,
    pub status: SpaceStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpaceRegistry {
    pub tenant_id: String,
    pub spaces: Vec<Space>,
    pub version: u32,
}

impl SpaceRegistry {
    fn new(tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            spaces: vec![general_space(tenant_id)],
            version: 1,
        }
    }
}

fn general_space(tenant_id: &str) -> Space {
    Space {
        space_id: GENERAL_SPACE_ID.to_string(),
        tenant_id: tenant_id.to_string(),
        name: "General".to_string(),
        authority_score: 1.0,
        auto_created: false,
        status: SpaceStatus::Active,
    }
}

fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    for c in text.to_lowercase().chars() {
        if c.is_alphanumeric() {
            slug.push(c);
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    slug.trim_end_matches('-').to_string()
}

/// Registry CRUD plus the document → space resolver. Seed spaces are
/// matched by name-token overlap with the head of the document; when no
/// seed matches, a space is auto-created from the first salient phrase.
pub struct SpaceManager {
    data_dir: PathBuf,
    registries: Mutex<HashMap<String, SpaceRegistry>>,
}

impl SpaceManager {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            registries: Mutex::new(HashMap::new()),
        }
    }

    fn registry_path(&self, tenant_id: &str) -> PathBuf {
        self.data_dir.join(format!("spaces-{tenant_id}.json"))
    }

    fn load_or_init<'a>(
        &self,
        registries: &'a mut HashMap<String, SpaceRegistry>,
        tenant_id: &str,
    ) -> &'a mut SpaceRegistry {
        if !registries.contains_key(tenant_id) {
            let registry = match std::fs::read_to_string(self.registry_path(tenant_id)) {
                Ok(content) => {
                    let mut registry: SpaceRegistry =
                        serde_json::from_str(&content).unwrap_or_else(|e| {
                            tracing::warn!(tenant = %tenant_id, error = %e, "space registry corrupt");
                            SpaceRegistry::new(tenant_id)
                        });
                    if !registry.spaces.iter().any(|s| s.space_id == GENERAL_SPACE_ID) {
                        registry.spaces.push(general_space(tenant_id));
                    }
                    registry
                }
                Err(_) => SpaceRegistry::new(tenant_id),
            };
            registries.insert(tenant_id.to_string(), registry);
        }
        registries
            .entry(tenant_id.to_string())
            .or_insert_with(|| SpaceRegistry::new(tenant_id))
    }

    fn persist(&self, registry: &SpaceRegistry) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("creating data dir {}", self.data_dir.display()))?;
        let path = self.registry_path(&registry.tenant_id);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_string_pretty(registry).context("serializing space registry")?;
        std::fs::write(&tmp, body).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &path).with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }

    pub fn list_spaces(&self, tenant_id: &str) -> Vec<Space> {
        let mut registries = self.registries.lock();
        self.load_or_init(&mut registries, tenant_id).spaces.clone()
    }

    pub fn get_space(&self, tenant_id: &str, space_id: &str) -> Option<Space> {
        self.list_spaces(tenant_id)
            .into_iter()
            .find(|s| s.space_id == space_id)
    }

    /// Create a seed space. Names are unique per tenant.
    pub fn create_space(&self, tenant_id: &str, name: &str, authority_score: f32) -> Result<Space> {
        let mut registries = self.registries.lock();
        let registry = self.load_or_init(&mut registries, tenant_id);

        if registry.spaces.iter().any(|s| s.name.eq_ignore_ascii_case(name)) {
            anyhow::bail!("a space named '{name}' already exists for tenant {tenant_id}");
        }

        let space = Space {
            space_id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            name: name.to_string(),
            authority_score: authority_score.clamp(0.0, 1.0),
            auto_created: false,
            status: SpaceStatus::Active,
        };
        registry.spaces.push(space.clone());
        registry.version += 1;
        self.persist(registry)?;
        Ok(space)
    }

    pub fn archive_space(&self, tenant_id: &str, space_id: &str) -> Result<()> {
        if space_id == GENERAL_SPACE_ID {
            anyhow::bail!("the general space cannot be archived");
        }
        let mut registries = self.registries.lock();
        let registry = self.load_or_init(&mut registries, tenant_id);
        let space = registry
            .spaces
            .iter_mut()
            .find(|s| s.space_id == space_id)
            .with_context(|| format!("space {space_id} not found"))?;
        space.status = SpaceStatus::Archived;
        registry.version += 1;
        self.persist(registry)?;
        Ok(())
    }

    /// Assign a document to a space. Seed spaces win on name-token overlap
    /// with the document head (highest authority first); otherwise a space
    /// is auto-created from the first salient phrase, and the general
    /// space takes documents with nothing salient at all.
    pub fn resolve_space(&self, tenant_id: &str, doc_text: &str) -> Result<Space> {
        let head: String = doc_text.split_whitespace().take(50).collect::<Vec<_>>().join(" ");
        let head_tokens = tokenize(&head);

        let mut registries = self.registries.lock();
        let registry = self.load_or_init(&mut registries, tenant_id);

        let mut seeds: Vec<&Space> = registry
            .spaces
            .iter()
            .filter(|s| s.status == SpaceStatus::Active && s.space_id != GENERAL_SPACE_ID)
            .collect();
        seeds.sort_by(|a, b| {
            b.authority_score
                .partial_cmp(&a.authority_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.name.cmp(&b.name))
        });

        for seed in seeds {
            let name_tokens = tokenize(&seed.name);
            if !name_tokens.is_empty() && name_tokens.iter().any(|t| head_tokens.contains(t)) {
                return Ok(seed.clone());
            }
        }

        let phrase: Vec<String> = head_tokens.into_iter().take(3).collect();
        if phrase.is_empty() {
            return Ok(registry
                .spaces
                .iter()
                .find(|s| s.space_id == GENERAL_SPACE_ID)
                .cloned()
                .unwrap_or_else(|| general_space(tenant_id)));
        }

        let slug = slugify(&phrase.join(" "));
        if let Some(existing) = registry.spaces.iter().find(|s| s.space_id == slug) {
            return Ok(existing.clone());
        }

        let space = Space {
            space_id: slug,
            tenant_id: tenant_id.to_string(),
            name: phrase.join(" "),
            authority_score: 0.5,
            auto_created: true,
            status: SpaceStatus::Active,
        };
        registry.spaces.push(space.clone());
        registry.version += 1;
        self.persist(registry)?;

        tracing::info!(
            tenant = %tenant_id,
            space = %space.space_id,
            "auto-created space from document head"
        );
        Ok(space)
    }
}
