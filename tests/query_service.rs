use async_trait::async_trait;
use permquery::cache::CacheError;
use permquery::catalog::types::ScalarType;
use permquery::permission::PermissionError;
use permquery::{
    CacheStore, Catalog, Error, ErrorCode, KindSchema, KindSpec, Mask, MemoryExecutor,
    MemoryStore, QueryParams, QueryService, Record, Relationship, RelationshipResolver,
    RequesterContext, ServiceConfig, Status, Value,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

fn mask(bits: u16) -> Mask {
    Mask::new(bits).expect("mask")
}

fn catalog() -> Arc<Catalog> {
    let customers = KindSpec::new("customers")
        .field("customer_number", ScalarType::Integer)
        .field("customer_name", ScalarType::Text)
        .field("country", ScalarType::Text)
        .field_masked("phone", ScalarType::Text, mask(0o600))
        .field("sales_rep", ScalarType::Integer)
        .back_reference("orders", "orders", "customer_number")
        .primary_key("customer_number")
        .owner_field("customer_number")
        .group_field("sales_rep")
        .mask(mask(0o606));
    let orders = KindSpec::new("orders")
        .field("order_number", ScalarType::Integer)
        .reference("customer_number", "customers")
        .field("status", ScalarType::Text)
        .primary_key("order_number")
        .owner_field("customer_number")
        .mask(mask(0o604));
    Arc::new(Catalog::from_specs([customers, orders]).expect("catalog"))
}

fn customer(number: i64, name: &str, country: &str) -> Record {
    Record::new()
        .with("customer_number", number)
        .with("customer_name", name)
        .with("country", country)
        .with("phone", format!("555-{number:04}"))
        .with("sales_rep", 1370i64)
}

fn order(number: i64, customer: i64, status: &str) -> Record {
    Record::new()
        .with("order_number", number)
        .with("customer_number", customer)
        .with("status", status)
}

fn seeded_executor(catalog: &Arc<Catalog>) -> Arc<MemoryExecutor> {
    let executor = MemoryExecutor::new(catalog.clone());
    for record in [
        customer(103, "Atelier graphique", "France"),
        customer(112, "Signal Gift Stores", "USA"),
        customer(201, "UK Collectables", "UK"),
        customer(216, "Enaco Distributors", "Spain"),
        customer(240, "giftsbymail.co.uk", "UK"),
    ] {
        executor.insert("customers", record).expect("seed customer");
    }
    for record in [
        order(10100, 103, "Shipped"),
        order(10101, 103, "Cancelled"),
        order(10102, 112, "Shipped"),
    ] {
        executor.insert("orders", record).expect("seed order");
    }
    Arc::new(executor)
}

struct Harness {
    service: QueryService,
    executor: Arc<MemoryExecutor>,
}

fn harness() -> Harness {
    let catalog = catalog();
    let executor = seeded_executor(&catalog);
    let service = QueryService::from_config(catalog, executor.clone(), ServiceConfig::default())
        .expect("service");
    Harness { service, executor }
}

fn anyone() -> RequesterContext {
    RequesterContext::anonymous()
}

fn names(items: &[Record]) -> Vec<&str> {
    items
        .iter()
        .filter_map(|r| r.get("customer_name").and_then(Value::as_text))
        .collect()
}

#[tokio::test]
async fn list_filters_sorts_and_pages() {
    let h = harness();
    let params = QueryParams::default()
        .filter("customer_number<230 and customer_number>200 and country==\"UK\"")
        .sort("-customer_number");
    let page = h
        .service
        .list("customers", &params, &anyone())
        .await
        .expect("list");
    assert_eq!(names(&page.items), vec!["UK Collectables"]);
    assert_eq!((page.page, page.size, page.offset), (1, 5, 0));

    let params = QueryParams::default()
        .sort("customer_name")
        .with("page", "2")
        .with("size", "2");
    let page = h
        .service
        .list("customers", &params, &anyone())
        .await
        .expect("list");
    assert_eq!(names(&page.items), vec!["Signal Gift Stores", "UK Collectables"]);
    assert_eq!(page.page, 2);
}

#[tokio::test]
async fn identical_reads_are_served_from_cache() {
    let h = harness();
    let params = QueryParams::default().filter("country == 'UK' and customer_number > 0");
    let first = h
        .service
        .list("customers", &params, &anyone())
        .await
        .expect("first");
    let reads = h.executor.calls().reads();

    let reordered = QueryParams::default().filter("customer_number > 0 AND country == \"UK\"");
    let second = h
        .service
        .list("customers", &reordered, &anyone())
        .await
        .expect("second");
    assert_eq!(first, second);
    assert_eq!(h.executor.calls().reads(), reads);
    assert_eq!(h.service.metrics().hits, 1);

    let id = Value::Integer(103);
    h.service
        .get("customers", &id, &QueryParams::default(), &anyone())
        .await
        .expect("get");
    let reads = h.executor.calls().reads();
    h.service
        .get("customers", &id, &QueryParams::default(), &anyone())
        .await
        .expect("get again");
    assert_eq!(h.executor.calls().reads(), reads);
}

#[tokio::test]
async fn writes_invalidate_point_and_list_entries() {
    let h = harness();
    let id = Value::Integer(201);
    let owner = RequesterContext::caller(201i64);
    let uk = QueryParams::default().filter("country == 'UK'");

    let before = h.service.list("customers", &uk, &anyone()).await.expect("list");
    assert_eq!(before.items.len(), 2);
    h.service
        .get("customers", &id, &QueryParams::default(), &owner)
        .await
        .expect("get");

    let updated = h
        .service
        .update(
            "customers",
            &id,
            &Record::new().with("country", "Ireland").with("phone", "555-9999"),
            &owner,
        )
        .await
        .expect("owner may write");
    assert_eq!(updated.get("phone").and_then(Value::as_text), Some("555-9999"));

    let after = h.service.list("customers", &uk, &anyone()).await.expect("list");
    assert_eq!(names(&after.items), vec!["giftsbymail.co.uk"]);
    let fresh = h
        .service
        .get("customers", &id, &QueryParams::default(), &owner)
        .await
        .expect("get");
    assert_eq!(fresh.get("country").and_then(Value::as_text), Some("Ireland"));
    assert!(h.service.metrics().invalidations >= 1);
}

#[tokio::test]
async fn hidden_fields_are_never_projected() {
    let h = harness();
    let id = Value::Integer(103);
    let params = QueryParams::default().fields("customer_name,phone");

    let stranger = h
        .service
        .get("customers", &id, &params, &RequesterContext::caller(999i64))
        .await
        .expect("get");
    assert_eq!(stranger, Record::new().with("customer_name", "Atelier graphique"));

    let owner = h
        .service
        .get("customers", &id, &params, &RequesterContext::caller(103i64))
        .await
        .expect("get");
    assert_eq!(owner.get("phone").and_then(Value::as_text), Some("555-0103"));

    let page = h
        .service
        .list("customers", &QueryParams::default(), &RequesterContext::caller(112i64))
        .await
        .expect("list");
    for item in &page.items {
        let own = item.get("customer_number") == Some(&Value::Integer(112));
        assert_eq!(item.contains("phone"), own);
    }
}

#[tokio::test]
async fn filtering_on_hidden_field_is_unknown_field() {
    let h = harness();
    let params = QueryParams::default().filter("phone == '555-0103'");
    let err = h
        .service
        .list("customers", &params, &anyone())
        .await
        .expect_err("phone is hidden from other");
    assert_eq!(err.code(), ErrorCode::UnknownField);
    assert_eq!(err.status(), Status::BadQuery);
    assert_eq!(h.executor.calls().reads(), 0);
}

#[tokio::test]
async fn unwritable_field_rejects_whole_write() {
    let h = harness();
    let id = Value::Integer(112);
    let before = h.executor.peek("customers", &id).expect("seeded");
    let payload = Record::new()
        .with("customer_name", "Renamed")
        .with("phone", "000");

    let err = h
        .service
        .update("customers", &id, &payload, &RequesterContext::caller(7i64))
        .await
        .expect_err("other may not write phone");
    assert!(matches!(
        err,
        Error::Permission(PermissionError::FieldNotWritable { ref field, relationship: Relationship::Other, .. })
            if field == "phone"
    ));
    assert_eq!(err.status(), Status::Forbidden);
    assert_eq!(h.executor.peek("customers", &id), Some(before));
    assert_eq!(h.executor.calls().writes(), 0);
}

#[tokio::test]
async fn update_cannot_move_a_record_to_another_primary_key() {
    let h = harness();
    let id = Value::Integer(103);
    let owner = RequesterContext::caller(103i64);
    let err = h
        .service
        .update("customers", &id, &Record::new().with("customer_number", 112i64), &owner)
        .await
        .expect_err("primary key is fixed");
    assert_eq!(err.code(), ErrorCode::ImmutableField);
    assert_eq!(err.status(), Status::Forbidden);
    assert_eq!(h.executor.calls().writes(), 0);

    let kept = h
        .service
        .get("customers", &id, &QueryParams::default(), &owner)
        .await
        .expect("still filed under its id");
    assert_eq!(kept.get("customer_number"), Some(&Value::Integer(103)));
    let params = QueryParams::default().sort("customer_number");
    let page = h.service.list("customers", &params, &anyone()).await.expect("list");
    let ids: Vec<Value> = page
        .items
        .iter()
        .filter_map(|r| r.get("customer_number").cloned())
        .collect();
    assert_eq!(ids, [103i64, 112, 201, 216, 240].map(Value::Integer));
}

#[tokio::test]
async fn update_rejects_values_of_the_wrong_type() {
    let h = harness();
    let id = Value::Integer(201);
    let before = h.executor.peek("customers", &id).expect("seeded");
    let err = h
        .service
        .update(
            "customers",
            &id,
            &Record::new().with("customer_name", "UK Gifts").with("sales_rep", "1370"),
            &RequesterContext::caller(201i64),
        )
        .await
        .expect_err("sales_rep is an integer");
    assert!(matches!(
        err,
        Error::Permission(PermissionError::TypeMismatch { ref field, expected: ScalarType::Integer, .. })
            if field == "sales_rep"
    ));
    assert_eq!(err.status(), Status::BadQuery);
    assert_eq!(h.executor.peek("customers", &id), Some(before));
}

#[tokio::test]
async fn model_without_write_bit_rejects_update_and_delete() {
    let h = harness();
    let id = Value::Integer(10100);
    let stranger = RequesterContext::caller(112i64);
    let err = h
        .service
        .update("orders", &id, &Record::new().with("status", "Returned"), &stranger)
        .await
        .expect_err("orders are read-only for other");
    assert_eq!(err.code(), ErrorCode::ModelNotWritable);
    let err = h
        .service
        .delete("orders", &id, &stranger)
        .await
        .expect_err("orders are read-only");
    assert_eq!(err.code(), ErrorCode::ModelNotWritable);
    assert!(h.executor.peek("orders", &id).is_some());
}

#[tokio::test]
async fn delete_removes_record_and_cached_copies() {
    let h = harness();
    let id = Value::Integer(216);
    let owner = RequesterContext::caller(216i64);
    h.service
        .get("customers", &id, &QueryParams::default(), &owner)
        .await
        .expect("cached");
    h.service.delete("customers", &id, &owner).await.expect("delete");

    let err = h
        .service
        .get("customers", &id, &QueryParams::default(), &owner)
        .await
        .expect_err("gone");
    assert_eq!(err.status(), Status::NotFound);
    let err = h
        .service
        .delete("customers", &id, &owner)
        .await
        .expect_err("already gone");
    assert_eq!(err.code(), ErrorCode::NotFound);
}

#[tokio::test]
async fn edge_listing_follows_back_reference() {
    let h = harness();
    let page = h
        .service
        .list_edge(
            "customers",
            &Value::Integer(103),
            "orders",
            &QueryParams::default().sort("-order_number"),
            &anyone(),
        )
        .await
        .expect("orders of 103");
    let numbers: Vec<_> = page
        .items
        .iter()
        .filter_map(|r| r.get("order_number").cloned())
        .collect();
    assert_eq!(numbers, vec![Value::Integer(10101), Value::Integer(10100)]);

    let filtered = h
        .service
        .list_edge(
            "customers",
            &Value::Integer(103),
            "orders",
            &QueryParams::default().filter("status == 'Shipped'"),
            &anyone(),
        )
        .await
        .expect("filtered");
    assert_eq!(filtered.items.len(), 1);

    let err = h
        .service
        .list_edge("customers", &Value::Integer(1), "orders", &QueryParams::default(), &anyone())
        .await
        .expect_err("no such parent");
    assert_eq!(err.code(), ErrorCode::NotFound);
}

#[tokio::test]
async fn bad_queries_never_reach_storage_or_cache() {
    let h = harness();
    for filter in ["customer_name", "country = 'UK'", "country == 'UK", "email == 1"] {
        let err = h
            .service
            .list("customers", &QueryParams::default().filter(filter), &anyone())
            .await
            .expect_err(filter);
        assert_eq!(err.status(), Status::BadQuery, "{filter}");
    }
    let err = h
        .service
        .list("customers", &QueryParams::default().with("size", "101"), &anyone())
        .await
        .expect_err("size above limit");
    assert_eq!(err.code(), ErrorCode::InvalidPagination);
    let err = h
        .service
        .list("planets", &QueryParams::default(), &anyone())
        .await
        .expect_err("unknown kind");
    assert_eq!(err.status(), Status::NotFound);

    assert_eq!(h.executor.calls().reads(), 0);
    let metrics = h.service.metrics();
    assert_eq!(metrics.hits + metrics.misses, 0);
}

struct EveryoneOwnsFive;

impl RelationshipResolver for EveryoneOwnsFive {
    fn relationship(
        &self,
        _schema: &KindSchema,
        requester: &RequesterContext,
        _record: &Record,
    ) -> Relationship {
        if requester.caller_id == Some(Value::Integer(5)) {
            Relationship::Owner
        } else {
            Relationship::Other
        }
    }
}

#[tokio::test]
async fn per_kind_resolver_overrides_ownership() {
    let catalog = catalog();
    let executor = seeded_executor(&catalog);
    let service = QueryService::from_config(catalog, executor, ServiceConfig::default())
        .expect("service")
        .with_resolver("customers", Arc::new(EveryoneOwnsFive));

    let admin = RequesterContext::caller(5i64);
    let record = service
        .get("customers", &Value::Integer(240), &QueryParams::default(), &admin)
        .await
        .expect("get");
    assert!(record.contains("phone"));

    let real_owner = RequesterContext::caller(240i64);
    let record = service
        .get("customers", &Value::Integer(240), &QueryParams::default(), &real_owner)
        .await
        .expect("get");
    assert!(!record.contains("phone"));
}

/// Memory store whose operations can be made to fail on demand.
struct FlakyStore {
    inner: MemoryStore,
    fail_reads: AtomicBool,
    fail_invalidate: AtomicBool,
    fail_clear: AtomicBool,
    clears: AtomicU64,
}

impl FlakyStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(64),
            fail_reads: AtomicBool::new(false),
            fail_invalidate: AtomicBool::new(false),
            fail_clear: AtomicBool::new(false),
            clears: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl CacheStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("connection reset".into()));
        }
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        self.inner.set(key, value, ttl).await
    }

    async fn invalidate(&self, pattern: &str) -> Result<u64, CacheError> {
        if self.fail_invalidate.load(Ordering::SeqCst) {
            return Err(CacheError::Timeout);
        }
        self.inner.invalidate(pattern).await
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.clears.fetch_add(1, Ordering::SeqCst);
        if self.fail_clear.load(Ordering::SeqCst) {
            return Err(CacheError::Timeout);
        }
        self.inner.clear().await
    }
}

fn flaky_harness() -> (QueryService, Arc<MemoryExecutor>, Arc<FlakyStore>) {
    let catalog = catalog();
    let executor = seeded_executor(&catalog);
    let store = Arc::new(FlakyStore::new());
    let service = QueryService::new(
        catalog,
        executor.clone(),
        store.clone(),
        ServiceConfig::default(),
    )
    .expect("service");
    (service, executor, store)
}

#[tokio::test]
async fn cache_read_failure_degrades_to_storage() {
    let (service, executor, store) = flaky_harness();
    store.fail_reads.store(true, Ordering::SeqCst);
    let params = QueryParams::default().filter("country == 'USA'");
    for _ in 0..2 {
        let page = service.list("customers", &params, &anyone()).await.expect("list");
        assert_eq!(names(&page.items), vec!["Signal Gift Stores"]);
    }
    assert_eq!(executor.calls().reads(), 2);
    assert!(service.metrics().errors >= 2);
}

#[tokio::test]
async fn failed_invalidation_falls_back_to_clear() {
    let (service, _executor, store) = flaky_harness();
    let id = Value::Integer(112);
    let owner = RequesterContext::caller(112i64);
    let usa = QueryParams::default().filter("country == 'USA'");
    service.list("customers", &usa, &anyone()).await.expect("warm");

    store.fail_invalidate.store(true, Ordering::SeqCst);
    service
        .update("customers", &id, &Record::new().with("country", "Canada"), &owner)
        .await
        .expect("write is acknowledged");
    assert_eq!(store.clears.load(Ordering::SeqCst), 1);

    let page = service.list("customers", &usa, &anyone()).await.expect("list");
    assert!(page.items.is_empty());
}

#[tokio::test]
async fn failed_clear_still_acknowledges_committed_write() {
    let (service, executor, store) = flaky_harness();
    store.fail_invalidate.store(true, Ordering::SeqCst);
    store.fail_clear.store(true, Ordering::SeqCst);
    let id = Value::Integer(240);
    service
        .update(
            "customers",
            &id,
            &Record::new().with("customer_name", "Gifts by Mail"),
            &RequesterContext::caller(240i64),
        )
        .await
        .expect("storage mutation committed");
    let stored = executor.peek("customers", &id).expect("present");
    assert_eq!(stored.get("customer_name").and_then(Value::as_text), Some("Gifts by Mail"));
    assert!(service.metrics().errors >= 2);
}

#[tokio::test]
async fn slow_storage_times_out_as_unavailable() {
    let catalog = catalog();
    let executor = MemoryExecutor::new(catalog.clone()).with_latency(Duration::from_millis(500));
    let config = ServiceConfig {
        storage_timeout_ms: 20,
        ..ServiceConfig::default()
    };
    let service =
        QueryService::from_config(catalog, Arc::new(executor), config).expect("service");
    let err = service
        .list("customers", &QueryParams::default(), &anyone())
        .await
        .expect_err("timeout");
    assert!(matches!(err, Error::Timeout { operation: "select" }));
    assert_eq!(err.status(), Status::Unavailable);
}
