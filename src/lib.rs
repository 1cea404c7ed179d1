//! schemacache: REST operations generated from declared entity schemas, over a relational
//! store whose rows are mirrored into a hash cache.

pub mod cache;
pub mod case;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod jobs;
pub mod migration;
pub mod model;
pub mod response;
pub mod routes;
pub mod search;
pub mod session;
pub mod sql;
pub mod state;
pub mod store;
pub mod validation;

pub use cache::{CacheStore, MemoryCache};
pub use config::{load_entities_from_dir, EntityConfig, Settings};
pub use dispatch::{Api, ApiBuilder, Authorizer, Operation, StandardOperation};
pub use error::{AppError, ConfigError, ModelError, StoreError, ValidationError};
pub use jobs::{JobRunner, JobStatusOperation, JobSubmitOperation, JobWork};
pub use migration::ensure_tables;
pub use model::{EntityType, GetQuery, Registry, RegistryBuilder};
pub use response::{ApiRequest, ApiResponse, ValidatedRequest};
pub use routes::{api_routes, app, common_routes};
pub use search::{MemorySearchIndex, SearchIndex};
pub use session::{Backends, Session};
pub use state::AppState;
pub use store::{MemoryStore, PgStore, RelationalStore};
