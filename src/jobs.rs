//! Background jobs: work runs outside the request, its status is polled from the cache.
//!
//! Records live in the hash `<group>_jobs` (field = job hash, 7 day expiry set once) and the
//! latest record is mirrored to `<group>_last`.

use crate::cache::CacheStore;
use crate::dispatch::{panic_message, Operation};
use crate::error::{AppError, CacheError};
use crate::model::EntityType;
use crate::response::{ApiResponse, ValidatedRequest};
use crate::session::Session;
use async_trait::async_trait;
use axum::http::StatusCode;
use chrono::{DateTime, Local};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::{json, Map, Value};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

const JOBS_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

pub type JobFuture<'a> = BoxFuture<'a, Result<Value, AppError>>;

type SuspendableFn = Box<dyn for<'a> FnOnce(&'a mut Session) -> JobFuture<'a> + Send>;
type BlockingFn = Box<dyn FnOnce() -> Result<Value, AppError> + Send>;

/// A unit of work. Suspendable work gets its own session; blocking work runs on the
/// blocking pool.
pub enum JobWork {
    Suspendable(SuspendableFn),
    Blocking(BlockingFn),
}

impl JobWork {
    pub fn suspendable<F>(f: F) -> Self
    where
        F: for<'a> FnOnce(&'a mut Session) -> JobFuture<'a> + Send + 'static,
    {
        JobWork::Suspendable(Box::new(f))
    }

    pub fn blocking<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<Value, AppError> + Send + 'static,
    {
        JobWork::Blocking(Box::new(f))
    }
}

pub fn jobs_key(group: &str) -> String {
    format!("{}_jobs", group)
}

pub fn last_job_key(group: &str) -> String {
    format!("{}_last", group)
}

fn new_job_hash() -> String {
    format!("{:x}", rand::random::<u128>())
}

/// `H:MM:SS.mmm`
fn elapsed(d: chrono::Duration) -> String {
    let ms = d.num_milliseconds().max(0);
    format!(
        "{}:{:02}:{:02}.{:03}",
        ms / 3_600_000,
        (ms / 60_000) % 60,
        (ms / 1000) % 60,
        ms % 1000
    )
}

fn time_info(start: DateTime<Local>, end: DateTime<Local>) -> Value {
    json!({
        "start": start.format(TIME_FORMAT).to_string(),
        "end": end.format(TIME_FORMAT).to_string(),
        "elapsed": elapsed(end - start),
    })
}

#[derive(Clone)]
pub struct JobRunner {
    cache: Arc<dyn CacheStore>,
}

impl JobRunner {
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        JobRunner { cache }
    }

    /// The worker's own session: same stores, no shared transaction.
    pub fn copy_session(&self, session: &Session) -> Session {
        session.fork()
    }

    /// Record the job as running, schedule it and answer `201 {job_hash}` at once.
    pub async fn submit(&self, group: &str, work: JobWork, session: &Session) -> Result<ApiResponse, AppError> {
        let hash = new_job_hash();
        self.set_job(group, &hash, &json!({"status": "running"})).await?;
        let worker = self.copy_session(session);
        let runner = self.clone();
        let (owned_group, job) = (group.to_string(), hash.clone());
        tokio::spawn(async move { runner.watch(owned_group, job, work, worker).await });
        tracing::info!(group = %group, job = %hash, "job submitted");
        Ok(ApiResponse::created(json!({ "job_hash": hash })))
    }

    async fn watch(self, group: String, hash: String, work: JobWork, mut session: Session) {
        let start = Local::now();
        let outcome = match work {
            JobWork::Suspendable(f) => match AssertUnwindSafe(f(&mut session)).catch_unwind().await {
                Ok(result) => result.map_err(|e| (e.kind().to_string(), e.to_string())),
                Err(panic) => Err(("Panic".to_string(), panic_message(panic.as_ref()))),
            },
            JobWork::Blocking(f) => match tokio::task::spawn_blocking(f).await {
                Ok(result) => result.map_err(|e| (e.kind().to_string(), e.to_string())),
                Err(e) if e.is_panic() => Err(("Panic".to_string(), panic_message(e.into_panic().as_ref()))),
                Err(e) => Err(("Cancelled".to_string(), e.to_string())),
            },
        };
        session.close().await;
        let end = Local::now();

        let (status, result) = match outcome {
            Ok(value) => ("done", value),
            Err((name, message)) => {
                tracing::error!(group = %group, job = %hash, %name, %message, "job failed");
                ("error", json!({ "name": name, "message": message }))
            }
        };
        let record = json!({ "status": status, "result": result, "time_info": time_info(start, end) });
        if let Err(e) = self.set_job(&group, &hash, &record).await {
            tracing::error!(group = %group, job = %hash, error = %e, "failed to record job result");
        } else {
            tracing::info!(group = %group, job = %hash, status, "job finished");
        }
    }

    pub async fn set_job(&self, group: &str, hash: &str, record: &Value) -> Result<(), CacheError> {
        let key = jobs_key(group);
        let text = record.to_string();
        self.cache.hset(&key, hash, &text).await?;
        if self.cache.ttl(&key).await?.is_none() {
            self.cache.expire(&key, JOBS_TTL).await?;
        }
        self.cache.set(&last_job_key(group), &text).await
    }

    /// One record (`hash`, or `"last"`), or every record grouped by status.
    pub async fn get(&self, group: &str, hash: Option<&str>) -> Result<ApiResponse, AppError> {
        let record = match hash {
            None => self.all(group).await?,
            Some("last") => self.cache.get(&last_job_key(group)).await?.map(|t| decode(group, "last", &t)).transpose()?,
            Some(hash) => self
                .cache
                .hget(&jobs_key(group), hash)
                .await?
                .map(|t| decode(group, hash, &t))
                .transpose()?,
        };
        Ok(match record {
            Some(record) => ApiResponse::ok(record),
            None => ApiResponse::empty(StatusCode::NOT_FOUND),
        })
    }

    async fn all(&self, group: &str) -> Result<Option<Value>, AppError> {
        let jobs = self.cache.hgetall(&jobs_key(group)).await?;
        if jobs.is_empty() {
            return Ok(None);
        }
        let mut by_status: Map<String, Value> = Map::new();
        for (hash, text) in jobs {
            let Value::Object(mut record) = decode(group, &hash, &text)? else {
                continue;
            };
            let status = match record.remove("status") {
                Some(Value::String(s)) => s,
                _ => "unknown".to_string(),
            };
            if let Value::Object(entries) = by_status.entry(status).or_insert_with(|| json!({})) {
                entries.insert(hash, Value::Object(record));
            }
        }
        Ok(Some(Value::Object(by_status)))
    }
}

fn decode(group: &str, field: &str, text: &str) -> Result<Value, CacheError> {
    serde_json::from_str(text).map_err(|source| CacheError::Decode {
        key: jobs_key(group),
        field: field.to_string(),
        source,
    })
}

/// Builds the job's work from the validated request.
pub type JobFactory = Arc<dyn Fn(&EntityType, &ValidatedRequest) -> Result<JobWork, AppError> + Send + Sync>;

/// Submits a job per request. The group defaults to the entity key.
pub struct JobSubmitOperation {
    runner: JobRunner,
    group: Option<String>,
    factory: JobFactory,
}

impl JobSubmitOperation {
    pub fn new<F>(runner: JobRunner, factory: F) -> Self
    where
        F: Fn(&EntityType, &ValidatedRequest) -> Result<JobWork, AppError> + Send + Sync + 'static,
    {
        JobSubmitOperation {
            runner,
            group: None,
            factory: Arc::new(factory),
        }
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }
}

#[async_trait]
impl Operation for JobSubmitOperation {
    async fn call(&self, entity: &EntityType, req: ValidatedRequest, session: &mut Session) -> Result<ApiResponse, AppError> {
        let work = (self.factory)(entity, &req)?;
        let group = self.group.as_deref().unwrap_or(&entity.key);
        self.runner.submit(group, work, session).await
    }
}

/// Reads job records; the hash comes from the `job_hash` query parameter.
pub struct JobStatusOperation {
    runner: JobRunner,
    group: Option<String>,
}

impl JobStatusOperation {
    pub fn new(runner: JobRunner) -> Self {
        JobStatusOperation { runner, group: None }
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }
}

#[async_trait]
impl Operation for JobStatusOperation {
    async fn call(&self, entity: &EntityType, req: ValidatedRequest, _: &mut Session) -> Result<ApiResponse, AppError> {
        let hash = match req.query.get("job_hash") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
            None => None,
        };
        let group = self.group.as_deref().unwrap_or(&entity.key);
        self.runner.get(group, hash.as_deref()).await
    }
}
