//! Entity registry: register every declaration, then build once into an immutable arena
//! with resolved relationships and backreference adjacency.

use crate::case::entity_key;
use crate::config::{ApiSchema, Cardinality, EntityConfig, EntityKind, DEFAULT_KEY_SEPARATOR};
use crate::error::ConfigError;
use crate::store::{Column, TableDef};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Index of an entity type in the registry arena.
pub type EntityId = usize;

/// Which side stores the join value of a relationship.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForeignKeySide {
    /// The source row holds `local_column`, pointing at the target.
    Local,
    /// Target rows hold `remote_column`, pointing back at the source.
    Remote,
    /// A join table holds both ends.
    JoinTable,
}

#[derive(Clone, Debug, PartialEq)]
pub struct JoinTable {
    pub table: TableDef,
    /// Join column matching `source.local_column`.
    pub source_column: String,
    /// Join column matching `target.remote_column`.
    pub target_column: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Relationship {
    pub name: String,
    pub source: EntityId,
    pub target: EntityId,
    pub cardinality: Cardinality,
    pub local_column: String,
    pub remote_column: String,
    pub secondary: Option<JoinTable>,
    pub fk_side: ForeignKeySide,
}

/// Incoming edge: `source.relationships[relationship]` targets this entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackRef {
    pub source: EntityId,
    pub relationship: usize,
}

#[derive(Clone, Debug)]
pub struct EntityType {
    pub id: EntityId,
    pub name: String,
    pub key: String,
    pub kind: EntityKind,
    pub table: TableDef,
    /// Identity fields, sorted by name.
    pub id_names: Vec<String>,
    pub relationships: Vec<Relationship>,
    pub backrefs: Vec<BackRef>,
    pub use_cache: bool,
    pub use_search: bool,
    pub key_separator: String,
    pub todict_schema: Map<String, Value>,
    pub api: Option<ApiSchema>,
}

impl EntityType {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.table.column(name)
    }

    pub fn relationship(&self, name: &str) -> Option<&Relationship> {
        self.relationships.iter().find(|r| r.name == name)
    }

    /// Set recording every filtered bucket created for this entity.
    pub fn filters_names_key(&self) -> String {
        format!("{}__filters_names", self.key)
    }

    /// Bucket for a query shape: the entity key, suffixed with the filter field names.
    pub fn bucket(&self, filter_names: &[String]) -> String {
        if filter_names.is_empty() {
            self.key.clone()
        } else {
            format!("{}_{}", self.key, filter_names.join("_"))
        }
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    configs: Vec<(String, EntityConfig)>,
    key_separator: Option<String>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Separator for identity keys of entities that do not declare their own.
    pub fn key_separator(mut self, sep: impl Into<String>) -> Self {
        self.key_separator = Some(sep.into());
        self
    }

    pub fn register(&mut self, config: EntityConfig) -> Result<&mut Self, ConfigError> {
        let key = config.key.clone().unwrap_or_else(|| entity_key(&config.name));
        if self.configs.iter().any(|(k, _)| *k == key) {
            return Err(ConfigError::DuplicateEntity(key));
        }
        self.configs.push((key, config));
        Ok(self)
    }

    pub fn register_all(mut self, configs: impl IntoIterator<Item = EntityConfig>) -> Result<Self, ConfigError> {
        for config in configs {
            self.register(config)?;
        }
        Ok(self)
    }

    pub fn build(self) -> Result<Registry, ConfigError> {
        let default_sep = self
            .key_separator
            .unwrap_or_else(|| DEFAULT_KEY_SEPARATOR.to_string());

        let mut entities = Vec::with_capacity(self.configs.len());
        for (id, (key, config)) in self.configs.iter().enumerate() {
            entities.push(build_entity(id, key, config, &default_sep)?);
        }

        let mut by_key = HashMap::new();
        let mut by_name = HashMap::new();
        for e in &entities {
            by_key.insert(e.key.clone(), e.id);
            by_name.insert(e.name.clone(), e.id);
        }

        for (id, (_, config)) in self.configs.iter().enumerate() {
            let mut relationships = Vec::with_capacity(config.relationships.len());
            for rel in &config.relationships {
                let target = by_key
                    .get(&rel.target)
                    .or_else(|| by_name.get(&rel.target))
                    .copied()
                    .ok_or_else(|| ConfigError::MissingReference {
                        kind: "relationship target",
                        id: rel.target.clone(),
                    })?;
                relationships.push(resolve_relationship(&entities, id, target, rel)?);
            }
            entities[id].relationships = relationships;
        }

        let mut backrefs: Vec<Vec<BackRef>> = vec![Vec::new(); entities.len()];
        for source in &entities {
            for (idx, rel) in source.relationships.iter().enumerate() {
                if rel.target != source.id {
                    backrefs[rel.target].push(BackRef {
                        source: source.id,
                        relationship: idx,
                    });
                }
            }
        }
        for (entity, refs) in entities.iter_mut().zip(backrefs) {
            entity.backrefs = refs;
        }

        tracing::info!(entities = entities.len(), "entity registry built");
        Ok(Registry {
            entities,
            by_key,
            by_name,
        })
    }
}

fn build_entity(id: EntityId, key: &str, config: &EntityConfig, default_sep: &str) -> Result<EntityType, ConfigError> {
    let columns: Vec<Column> = config
        .columns
        .iter()
        .map(|c| Column {
            name: c.name.clone(),
            ty: c.type_,
            primary_key: c.primary_key,
            nullable: c.nullable && !c.primary_key,
            auto_increment: c.auto_increment,
            default: c.default.clone(),
        })
        .collect();

    let mut id_names: Vec<String> = match config.kind {
        EntityKind::Relational => columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.clone())
            .collect(),
        EntityKind::Cache => config.id_names.clone(),
    };
    id_names.sort();
    id_names.dedup();
    if id_names.is_empty() {
        return Err(ConfigError::NoPrimaryKey(config.name.clone()));
    }
    if config.kind == EntityKind::Relational && config.use_search {
        return Err(ConfigError::InvalidEntity {
            entity: config.name.clone(),
            reason: "only cache entities are mirrored into the search index".into(),
        });
    }
    if config.kind == EntityKind::Cache && !config.relationships.is_empty() {
        return Err(ConfigError::InvalidRelationship {
            entity: config.name.clone(),
            name: config.relationships[0].name.clone(),
            reason: "cache entities cannot declare relationships".into(),
        });
    }
    if let Some(name) = config
        .relationships
        .iter()
        .map(|r| &r.name)
        .find(|n| columns.iter().any(|c| &c.name == *n))
    {
        return Err(ConfigError::InvalidRelationship {
            entity: config.name.clone(),
            name: name.clone(),
            reason: "name clashes with a column".into(),
        });
    }

    Ok(EntityType {
        id,
        name: config.name.clone(),
        key: key.to_string(),
        kind: config.kind,
        table: TableDef {
            name: config.table.clone().unwrap_or_else(|| key.to_string()),
            columns,
            key_columns: id_names.clone(),
        },
        id_names,
        relationships: Vec::new(),
        backrefs: Vec::new(),
        use_cache: config.use_cache,
        use_search: config.use_search,
        key_separator: config
            .key_separator
            .clone()
            .unwrap_or_else(|| default_sep.to_string()),
        todict_schema: config.todict_schema.clone().unwrap_or_default(),
        api: config.api.clone(),
    })
}

fn resolve_relationship(
    entities: &[EntityType],
    source: EntityId,
    target: EntityId,
    rel: &crate::config::RelationshipConfig,
) -> Result<Relationship, ConfigError> {
    let src = &entities[source];
    let dst = &entities[target];
    let invalid = |reason: String| ConfigError::InvalidRelationship {
        entity: src.name.clone(),
        name: rel.name.clone(),
        reason,
    };
    if dst.kind != EntityKind::Relational {
        return Err(invalid(format!("target '{}' is not relational", dst.key)));
    }
    let local = src
        .column(&rel.local_column)
        .ok_or_else(|| invalid(format!("unknown column '{}'", rel.local_column)))?;
    let remote = dst
        .column(&rel.remote_column)
        .ok_or_else(|| invalid(format!("unknown column '{}' on '{}'", rel.remote_column, dst.key)))?;

    let (secondary, fk_side) = match &rel.secondary {
        Some(sec) => {
            let join_col = |name: &str, like: &Column| Column {
                name: name.to_string(),
                ty: like.ty,
                primary_key: true,
                nullable: false,
                auto_increment: false,
                default: None,
            };
            let mut key_columns = vec![sec.local_column.clone(), sec.remote_column.clone()];
            key_columns.sort();
            let table = TableDef {
                name: sec.table.clone(),
                columns: vec![join_col(&sec.local_column, local), join_col(&sec.remote_column, remote)],
                key_columns,
            };
            let join = JoinTable {
                table,
                source_column: sec.local_column.clone(),
                target_column: sec.remote_column.clone(),
            };
            (Some(join), ForeignKeySide::JoinTable)
        }
        None => {
            let local_is_key = src.id_names.contains(&rel.local_column);
            let remote_is_key = dst.id_names.contains(&rel.remote_column);
            if local_is_key && !remote_is_key {
                (None, ForeignKeySide::Remote)
            } else {
                (None, ForeignKeySide::Local)
            }
        }
    };
    if fk_side == ForeignKeySide::Local && rel.cardinality == Cardinality::Many {
        return Err(invalid(
            "a many relationship needs the foreign key on the target or a join table".into(),
        ));
    }
    Ok(Relationship {
        name: rel.name.clone(),
        source,
        target,
        cardinality: rel.cardinality,
        local_column: rel.local_column.clone(),
        remote_column: rel.remote_column.clone(),
        secondary,
        fk_side,
    })
}

/// Immutable, fully resolved entity graph shared by every session.
#[derive(Debug)]
pub struct Registry {
    entities: Vec<EntityType>,
    by_key: HashMap<String, EntityId>,
    by_name: HashMap<String, EntityId>,
}

impl Registry {
    pub fn get(&self, id: EntityId) -> &EntityType {
        &self.entities[id]
    }

    pub fn by_key(&self, key: &str) -> Option<&EntityType> {
        self.by_key.get(key).map(|id| &self.entities[*id])
    }

    pub fn by_name(&self, name: &str) -> Option<&EntityType> {
        self.by_name.get(name).map(|id| &self.entities[*id])
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityType> {
        self.entities.iter()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Join tables of every secondary relationship, deduplicated by name.
    pub fn join_tables(&self) -> Vec<&TableDef> {
        let mut out: Vec<&TableDef> = Vec::new();
        for e in &self.entities {
            for rel in &e.relationships {
                if let Some(join) = &rel.secondary {
                    if !out.iter().any(|t| t.name == join.table.name) {
                        out.push(&join.table);
                    }
                }
            }
        }
        out
    }
}
