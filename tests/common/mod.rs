#![allow(dead_code)]

use schemacache::model::{EntityType, Registry};
use schemacache::store::Row;
use schemacache::{Backends, EntityConfig, MemoryCache, MemorySearchIndex, MemoryStore, RegistryBuilder, Session};
use serde_json::{json, Value};
use std::sync::Arc;

pub fn row(v: Value) -> Row {
    v.as_object().cloned().expect("object")
}

/// Stores own items (foreign key on the item), items point at a maker, stores are tagged
/// through a join table, and cars live only in the cache.
pub fn entity_configs() -> Vec<EntityConfig> {
    serde_json::from_value(json!([
        {
            "name": "StoreModel",
            "columns": [
                {"name": "id", "type": "integer", "primary_key": true, "auto_increment": true},
                {"name": "name", "type": "string", "nullable": false}
            ],
            "relationships": [
                {"name": "items", "target": "item", "cardinality": "many", "local_column": "id", "remote_column": "store_id"},
                {"name": "tags", "target": "tag", "cardinality": "many", "local_column": "id", "remote_column": "id",
                 "secondary": {"table": "store_tags", "local_column": "store_id", "remote_column": "tag_id"}}
            ],
            "api": {
                "paths": {
                    "/stores": {
                        "post": {"operationId": "swagger_insert", "parameters": [
                            {"name": "body", "in": "body", "required": true, "schema": {"type": "array"}}
                        ]},
                        "get": {"operationId": "swagger_get_all", "parameters": [
                            {"name": "name", "in": "query"},
                            {"name": "limit", "in": "query", "type": "integer"},
                            {"name": "offset", "in": "query", "type": "integer"}
                        ]}
                    },
                    "/stores/{id}": {
                        "parameters": [{"name": "id", "in": "path", "required": true, "type": "integer"}],
                        "get": {"operationId": "swagger_get"},
                        "patch": {"operationId": "swagger_update", "parameters": [
                            {"name": "body", "in": "body", "required": true, "schema": {"$ref": "#/definitions/StorePatch"}}
                        ]},
                        "delete": {"operationId": "swagger_delete", "parameters": [
                            {"name": "Authorization", "in": "header", "required": true}
                        ]}
                    },
                    "/stores/explode": {
                        "post": {"operationId": "explode"}
                    },
                    "/stores/reindex": {
                        "post": {"operationId": "reindex"},
                        "get": {"operationId": "reindex_status", "parameters": [{"name": "job_hash", "in": "query"}]}
                    }
                },
                "definitions": {
                    "StorePatch": {
                        "type": "object",
                        "properties": {"name": {"type": "string"}},
                        "additionalProperties": false
                    }
                }
            }
        },
        {
            "name": "ItemModel",
            "columns": [
                {"name": "id", "type": "integer", "primary_key": true, "auto_increment": true},
                {"name": "store_id", "type": "integer"},
                {"name": "maker_id", "type": "integer"},
                {"name": "name", "type": "string"}
            ],
            "relationships": [
                {"name": "maker", "target": "maker", "cardinality": "one", "local_column": "maker_id", "remote_column": "id"}
            ]
        },
        {
            "name": "MakerModel",
            "columns": [
                {"name": "id", "type": "integer", "primary_key": true, "auto_increment": true},
                {"name": "name", "type": "string"}
            ]
        },
        {
            "name": "TagModel",
            "columns": [
                {"name": "id", "type": "integer", "primary_key": true},
                {"name": "label", "type": "string"}
            ]
        },
        {
            "name": "CarModel",
            "kind": "cache",
            "id_names": ["id"],
            "use_search": true,
            "api": {
                "paths": {
                    "/cars": {
                        "post": {"operationId": "swagger_insert", "parameters": [
                            {"name": "body", "in": "body", "required": true, "schema": {"type": "array"}}
                        ]}
                    },
                    "/cars/search": {
                        "get": {"operationId": "swagger_search", "parameters": [
                            {"name": "pattern", "in": "query", "required": true},
                            {"name": "page", "in": "query", "type": "integer"},
                            {"name": "size", "in": "query", "type": "integer"}
                        ]}
                    }
                }
            }
        }
    ]))
    .expect("entity declarations")
}

pub struct Fixture {
    pub store: MemoryStore,
    pub cache: Arc<MemoryCache>,
    pub search: Arc<MemorySearchIndex>,
    pub registry: Arc<Registry>,
    pub backends: Backends,
}

impl Fixture {
    pub fn new() -> Self {
        let registry = Arc::new(
            RegistryBuilder::new()
                .register_all(entity_configs())
                .expect("register")
                .build()
                .expect("build"),
        );
        let store = MemoryStore::new();
        let cache = Arc::new(MemoryCache::new());
        let search = Arc::new(MemorySearchIndex::new());
        let backends = Backends::new(Arc::new(store.clone()))
            .with_cache(cache.clone())
            .with_search(search.clone());
        Fixture {
            store,
            cache,
            search,
            registry,
            backends,
        }
    }

    pub fn session(&self) -> Session {
        Session::new(self.registry.clone(), self.backends.clone())
    }

    pub fn entity(&self, key: &str) -> &EntityType {
        self.registry.by_key(key).expect("entity")
    }

    /// Decoded cache entry, if any.
    pub async fn cached(&self, bucket: &str, key: &str) -> Option<Value> {
        use schemacache::CacheStore;
        self.cache
            .hget(bucket, key)
            .await
            .expect("cache read")
            .map(|text| serde_json::from_str(&text).expect("cached json"))
    }
}
