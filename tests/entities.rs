mod common;

use async_trait::async_trait;
use common::{row, Fixture};
use schemacache::error::{AppError, CacheError, StoreError};
use schemacache::{model, Backends, CacheStore, GetQuery, SearchIndex, Session};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Delegates to an inner cache; hash writes fail while `failing` is set.
struct FlakyCache {
    inner: Arc<dyn CacheStore>,
    failing: AtomicBool,
}

#[async_trait]
impl CacheStore for FlakyCache {
    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>, CacheError> {
        self.inner.hmget(key, fields).await
    }

    async fn hmset(&self, key: &str, entries: &[(String, String)]) -> Result<(), CacheError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CacheError::Backend("connection reset".into()));
        }
        self.inner.hmset(key, entries).await
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<u64, CacheError> {
        self.inner.hdel(key, fields).await
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>, CacheError> {
        self.inner.hgetall(key).await
    }

    async fn hkeys(&self, key: &str) -> Result<Vec<String>, CacheError> {
        self.inner.hkeys(key).await
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, CacheError> {
        self.inner.sadd(key, member).await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, CacheError> {
        self.inner.smembers(key).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), CacheError> {
        self.inner.set(key, value).await
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError> {
        self.inner.ttl(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        self.inner.expire(key, ttl).await
    }
}

fn by_id(id: i64) -> GetQuery {
    GetQuery {
        ids: Some(vec![row(json!({ "id": id }))]),
        ..Default::default()
    }
}

#[tokio::test]
async fn get_after_insert_reads_the_committed_dict() {
    let fx = Fixture::new();
    let store = fx.entity("store");
    let mut session = fx.session();

    let created = model::insert(&mut session, store, &json!({"name": "downtown"}))
        .await
        .expect("insert");
    let expected = json!({"id": 1, "name": "downtown", "items": [], "tags": []});
    assert_eq!(created, vec![expected.clone()]);
    assert_eq!(fx.cached("store", "1").await, Some(expected.clone()));

    let got = model::get(&mut session, store, by_id(1)).await.expect("get");
    assert_eq!(got, vec![expected.clone()]);

    fx.cache.hdel("store", &["1".to_string()]).await.expect("evict");
    let got = model::get(&mut session, store, by_id(1)).await.expect("get after evict");
    assert_eq!(got, vec![expected.clone()]);
    assert_eq!(fx.cached("store", "1").await, Some(expected));
    session.close().await;
}

#[tokio::test]
async fn missing_ids_are_skipped() {
    let fx = Fixture::new();
    let store = fx.entity("store");
    let mut session = fx.session();
    model::insert(&mut session, store, &json!([{"name": "a"}, {"name": "b"}]))
        .await
        .expect("insert");

    let query = GetQuery {
        ids: Some(vec![row(json!({"id": 2})), row(json!({"id": 40})), row(json!({"id": 1}))]),
        ..Default::default()
    };
    let got = model::get(&mut session, store, query).await.expect("get");
    let names: Vec<&Value> = got.iter().map(|d| &d["name"]).collect();
    assert_eq!(names, vec![&json!("b"), &json!("a")]);
    assert_eq!(fx.cached("store", "40").await, None);
}

#[tokio::test]
async fn filtered_buckets_are_registered_and_refreshed() {
    let fx = Fixture::new();
    let store = fx.entity("store");
    let mut session = fx.session();
    model::insert(&mut session, store, &json!({"name": "downtown"}))
        .await
        .expect("insert");

    let query = GetQuery {
        ids: Some(vec![row(json!({"id": 1}))]),
        filters: row(json!({"name": "downtown"})),
        ..Default::default()
    };
    assert_eq!(model::get(&mut session, store, query).await.expect("get").len(), 1);
    let names = fx.cache.smembers("store__filters_names").await.expect("smembers");
    assert_eq!(names, vec!["store_name".to_string()]);

    model::update(&mut session, store, &json!({"id": 1, "name": "uptown"}), None)
        .await
        .expect("update");
    for bucket in ["store", "store_name"] {
        let cached = fx.cached(bucket, "1").await.expect("cached");
        assert_eq!(cached["name"], json!("uptown"), "bucket {}", bucket);
    }
}

#[tokio::test]
async fn nested_insert_across_two_hops() {
    let fx = Fixture::new();
    let store = fx.entity("store");
    let mut session = fx.session();

    let created = model::insert(
        &mut session,
        store,
        &json!({
            "name": "hardware",
            "items": [
                {"_operation": "insert", "name": "bolt", "maker": {"_operation": "insert", "name": "acme"}},
                {"_operation": "insert", "name": "nut"}
            ]
        }),
    )
    .await
    .expect("insert");

    let bolt = json!({
        "id": 1, "store_id": 1, "maker_id": 1, "name": "bolt",
        "maker": {"id": 1, "name": "acme"}
    });
    let nut = json!({"id": 2, "store_id": 1, "maker_id": null, "name": "nut", "maker": null});
    assert_eq!(created[0]["items"], json!([bolt.clone(), nut.clone()]));

    let item = fx.entity("item");
    assert_eq!(model::get(&mut session, item, by_id(1)).await.expect("item"), vec![bolt.clone()]);
    assert_eq!(model::get(&mut session, item, by_id(2)).await.expect("item"), vec![nut]);
    let maker = fx.entity("maker");
    assert_eq!(
        model::get(&mut session, maker, by_id(1)).await.expect("maker"),
        vec![json!({"id": 1, "name": "acme"})]
    );
    assert_eq!(fx.cached("item", "1").await, Some(bolt));
}

#[tokio::test]
async fn writes_refresh_every_embedding_instance() {
    let fx = Fixture::new();
    let store = fx.entity("store");
    let item = fx.entity("item");
    let maker = fx.entity("maker");
    let mut session = fx.session();
    model::insert(
        &mut session,
        store,
        &json!({
            "name": "hardware",
            "items": [
                {"_operation": "insert", "name": "bolt", "maker": {"_operation": "insert", "name": "acme"}},
                {"_operation": "insert", "name": "nut"}
            ]
        }),
    )
    .await
    .expect("insert");

    // two hops: maker -> item -> store
    model::update(&mut session, maker, &json!({"id": 1, "name": "acme inc"}), None)
        .await
        .expect("rename maker");
    let cached = fx.cached("store", "1").await.expect("store cached");
    assert_eq!(cached["items"][0]["maker"]["name"], json!("acme inc"));
    let cached = fx.cached("item", "1").await.expect("item cached");
    assert_eq!(cached["maker"]["name"], json!("acme inc"));

    model::delete(&mut session, item, &[row(json!({"id": 1}))])
        .await
        .expect("delete item");
    assert_eq!(fx.cached("item", "1").await, None);
    let cached = fx.cached("store", "1").await.expect("store cached");
    assert_eq!(cached["items"].as_array().map(Vec::len), Some(1));
    assert_eq!(fx.store.rows("item").len(), 1);

    model::update(
        &mut session,
        store,
        &json!({"id": 1, "items": [{"_operation": "remove", "id": 2}]}),
        None,
    )
    .await
    .expect("remove item");
    assert_eq!(fx.cached("store", "1").await.expect("store")["items"], json!([]));
    assert_eq!(fx.cached("item", "2").await.expect("item")["store_id"], Value::Null);
}

#[tokio::test]
async fn join_table_links_follow_the_target() {
    let fx = Fixture::new();
    let store = fx.entity("store");
    let tag = fx.entity("tag");
    let mut session = fx.session();
    model::insert(&mut session, tag, &json!({"id": 7, "label": "open"}))
        .await
        .expect("tag");
    let created = model::insert(&mut session, store, &json!({"name": "corner", "tags": [{"id": 7}]}))
        .await
        .expect("store");
    assert_eq!(created[0]["tags"], json!([{"id": 7, "label": "open"}]));
    assert_eq!(fx.store.rows("store_tags").len(), 1);

    model::update(&mut session, tag, &json!({"id": 7, "label": "late"}), None)
        .await
        .expect("relabel");
    assert_eq!(
        fx.cached("store", "1").await.expect("store")["tags"],
        json!([{"id": 7, "label": "late"}])
    );

    model::delete(&mut session, tag, &[row(json!({"id": 7}))])
        .await
        .expect("delete tag");
    assert!(fx.store.rows("store_tags").is_empty());
    assert_eq!(fx.cached("store", "1").await.expect("store")["tags"], json!([]));
}

#[tokio::test]
async fn todict_feeds_back_into_insert() {
    let source = Fixture::new();
    let mut session = source.session();
    let created = model::insert(&mut session, source.entity("store"), &json!({"name": "mirror"}))
        .await
        .expect("insert");

    let target = Fixture::new();
    let mut session = target.session();
    let copied = model::insert(&mut session, target.entity("store"), &created[0])
        .await
        .expect("reinsert");
    assert_eq!(copied, created);
}

#[tokio::test]
async fn duplicate_keys_surface_as_integrity_errors() {
    let fx = Fixture::new();
    let store = fx.entity("store");
    let mut session = fx.session();
    model::insert(&mut session, store, &json!({"id": 1, "name": "a"}))
        .await
        .expect("first");

    let mut session = fx.session();
    let err = model::insert(&mut session, store, &json!({"id": 1, "name": "b"}))
        .await
        .expect_err("duplicate");
    match err {
        AppError::Store(StoreError::Integrity { code, .. }) => assert_eq!(code, "23505"),
        other => panic!("unexpected error: {other}"),
    }
    session.close().await;
    assert_eq!(fx.store.rows("store").len(), 1);
    assert_eq!(fx.cached("store", "1").await.expect("cached")["name"], json!("a"));
}

#[tokio::test]
async fn invalid_nested_operation_is_a_model_error() {
    let fx = Fixture::new();
    let mut session = fx.session();
    let input = json!({"name": "a", "items": [{"_operation": "fly"}]});
    let err = model::insert(&mut session, fx.entity("store"), &input)
        .await
        .expect_err("invalid");
    match err {
        AppError::Model(e) => {
            assert_eq!(e.to_body(), json!({"message": "Invalid nested operation \"fly\"", "instance": input}));
        }
        other => panic!("unexpected error: {other}"),
    }
    session.close().await;
    assert!(fx.store.rows("store").is_empty());
}

#[tokio::test]
async fn cache_entities_search_is_idempotent() {
    let fx = Fixture::new();
    let car = fx.entity("car");
    let mut session = fx.session();
    model::insert(
        &mut session,
        car,
        &json!([{"id": 1, "model": "beetle"}, {"id": 2, "model": "kombi"}]),
    )
    .await
    .expect("insert");

    let first = model::search(&mut session, car, "beetle", 0, 10).await.expect("search");
    let second = model::search(&mut session, car, "beetle", 0, 10).await.expect("search");
    assert_eq!(first, vec![json!({"id": 1, "model": "beetle"})]);
    assert_eq!(first, second);

    model::update(&mut session, car, &json!([{"id": 1, "model": "beetle", "year": 1970}]), None)
        .await
        .expect("update");
    let hits = fx.search.search("car", "beetle", 0, 10).await.expect("search");
    assert_eq!(hits, vec![json!({"id": 1, "model": "beetle", "year": 1970})]);
}

#[tokio::test]
async fn key_changes_drop_the_old_field_from_every_bucket() {
    let fx = Fixture::new();
    let store = fx.entity("store");
    let mut session = fx.session();
    model::insert(&mut session, store, &json!({"name": "downtown"}))
        .await
        .expect("insert");
    let query = GetQuery {
        ids: Some(vec![row(json!({"id": 1}))]),
        filters: row(json!({"name": "downtown"})),
        ..Default::default()
    };
    assert_eq!(model::get(&mut session, store, query).await.expect("get").len(), 1);
    assert!(fx.cached("store_name", "1").await.is_some());

    model::update(&mut session, store, &json!({"id": 5}), Some(vec![row(json!({"id": 1}))]))
        .await
        .expect("update");
    for bucket in ["store", "store_name"] {
        assert_eq!(fx.cached(bucket, "1").await, None, "bucket {}", bucket);
        let cached = fx.cached(bucket, "5").await.expect("renamed entry");
        assert_eq!(cached["id"], json!(5), "bucket {}", bucket);
        assert_eq!(cached["name"], json!("downtown"), "bucket {}", bucket);
    }
    session.close().await;
}

#[tokio::test]
async fn cache_failure_keeps_the_relational_commit() {
    let fx = Fixture::new();
    let store = fx.entity("store");
    let flaky = Arc::new(FlakyCache {
        inner: fx.cache.clone(),
        failing: AtomicBool::new(true),
    });
    let backends = Backends::new(Arc::new(fx.store.clone())).with_cache(flaky.clone());
    let mut session = Session::new(fx.registry.clone(), backends);

    let err = model::insert(&mut session, store, &json!({"name": "downtown"}))
        .await
        .expect_err("cache write fails");
    assert!(matches!(err, AppError::Cache(CacheError::Backend(_))), "{:?}", err);
    assert_eq!(fx.store.rows("store").len(), 1);
    assert_eq!(fx.cached("store", "1").await, None);

    flaky.failing.store(false, Ordering::SeqCst);
    model::insert(&mut session, store, &json!({"name": "uptown"}))
        .await
        .expect("second insert");
    assert_eq!(fx.store.rows("store").len(), 2);
    assert_eq!(fx.cached("store", "1").await, None);
    assert_eq!(fx.cached("store", "2").await.expect("cached")["name"], json!("uptown"));
    session.close().await;
}
