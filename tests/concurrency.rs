use permquery::catalog::types::ScalarType;
use permquery::{
    Catalog, KindSpec, Mask, MemoryExecutor, QueryParams, QueryService, Record, RequesterContext,
    ServiceConfig, Value,
};
use std::sync::Arc;

const ACCOUNTS: i64 = 32;

fn setup() -> (Arc<QueryService>, Arc<MemoryExecutor>) {
    let catalog = Arc::new(
        Catalog::from_specs([KindSpec::new("accounts")
            .field("id", ScalarType::Integer)
            .field("region", ScalarType::Text)
            .field("balance", ScalarType::Integer)
            .primary_key("id")
            .owner_field("id")
            .mask(Mask::new(0o644).expect("mask"))])
        .expect("catalog"),
    );
    let executor = Arc::new(MemoryExecutor::new(catalog.clone()));
    for id in 0..ACCOUNTS {
        let region = if id % 2 == 0 { "north" } else { "south" };
        executor
            .insert(
                "accounts",
                Record::new()
                    .with("id", id)
                    .with("region", region)
                    .with("balance", 100i64),
            )
            .expect("seed");
    }
    let service = QueryService::from_config(catalog, executor.clone(), ServiceConfig::default())
        .expect("service");
    (Arc::new(service), executor)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_identical_reads_agree() {
    let (service, executor) = setup();
    let params = QueryParams::default()
        .filter("region == 'north'")
        .sort("-id")
        .with("size", "10");

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let service = service.clone();
        let params = params.clone();
        tasks.push(tokio::spawn(async move {
            service
                .list("accounts", &params, &RequesterContext::anonymous())
                .await
                .expect("list")
        }));
    }
    let mut pages = Vec::new();
    for task in tasks {
        pages.push(task.await.expect("join"));
    }
    assert!(pages.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(pages[0].items.len(), 10);

    let reads = executor.calls().reads();
    service
        .list("accounts", &params, &RequesterContext::anonymous())
        .await
        .expect("warm read");
    assert_eq!(executor.calls().reads(), reads);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reads_after_concurrent_writes_see_latest_values() {
    let (service, executor) = setup();
    let mut tasks = Vec::new();
    for id in 0..ACCOUNTS {
        let service = service.clone();
        tasks.push(tokio::spawn(async move {
            let owner = RequesterContext::caller(id);
            let key = Value::Integer(id);
            service
                .get("accounts", &key, &QueryParams::default(), &owner)
                .await
                .expect("read");
            service
                .update("accounts", &key, &Record::new().with("balance", id * 10), &owner)
                .await
                .expect("write");
        }));
    }
    for task in tasks {
        task.await.expect("join");
    }
    assert_eq!(executor.calls().writes(), ACCOUNTS as u64);

    let params = QueryParams::default().sort("id").with("size", "100");
    let page = service
        .list("accounts", &params, &RequesterContext::anonymous())
        .await
        .expect("list");
    assert_eq!(page.items.len(), ACCOUNTS as usize);
    for (id, item) in (0..ACCOUNTS).zip(&page.items) {
        assert_eq!(item.get("balance"), Some(&Value::Integer(id * 10)));
        let point = service
            .get(
                "accounts",
                &Value::Integer(id),
                &QueryParams::default(),
                &RequesterContext::anonymous(),
            )
            .await
            .expect("get");
        assert_eq!(point.get("balance"), Some(&Value::Integer(id * 10)));
    }
}
