//! Integration tests for the entity cache over a mocked dashboard API.
//!
//! Covers TTL hits and expiry, optimistic create/update with rollback,
//! delete after confirmation, cancellation, pagination, stale fetches and
//! dependency invalidation of aggregates.

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use ledgerdash_client::{
    ApiClient, ApiError, CacheRegistry, CancellationToken, ClientConfig, CredentialStore, Domain,
    Entity, EntityCache, FetchOptions, ManualClock, RestSource, RestValue, TtlClass, ValueCache,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use wiremock::matchers::{body_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Deal {
    id: String,
    amount: i64,
}

impl Entity for Deal {
    type Id = String;

    fn id(&self) -> String {
        self.id.clone()
    }
}

type DealCache = EntityCache<Deal, RestSource<Deal>>;

fn deal(id: &str, amount: i64) -> Deal {
    Deal {
        id: id.to_string(),
        amount,
    }
}

fn create_test_client(mock_server: &MockServer) -> ApiClient {
    let credentials = CredentialStore::in_memory("test_");
    credentials
        .set_tokens(Some("access-1"), Some("refresh-1"))
        .expect("failed to seed credentials");
    let config = ClientConfig::default()
        .with_base_url(mock_server.uri())
        .with_max_retries(0);
    ApiClient::with_credentials(config, credentials).expect("failed to create client")
}

fn deal_cache(mock_server: &MockServer, clock: &ManualClock) -> DealCache {
    EntityCache::with_clock(
        Domain::DEALS,
        TtlClass::Medium,
        RestSource::new(create_test_client(mock_server), "/deals"),
        Arc::new(clock.clone()),
    )
}

fn patch(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("patch must be an object"),
    }
}

async fn mount_list(mock_server: &MockServer, deals: Value) {
    Mock::given(method("GET"))
        .and(path("/deals"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "data": deals
        })))
        .mount(mock_server)
        .await;
}

#[tokio::test]
async fn test_ttl_hit_then_expiry() {
    let mock_server = MockServer::start().await;

    let deals: Vec<Value> = (1..=10)
        .map(|i| json!({"id": i.to_string(), "amount": i * 100}))
        .collect();
    Mock::given(method("GET"))
        .and(path("/deals"))
        .and(query_param("page", "1"))
        .and(query_param("limit", "20"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "data": deals
        })))
        .expect(2)
        .mount(&mock_server)
        .await;

    let clock = ManualClock::default();
    let cache = deal_cache(&mock_server, &clock);

    // t = 0: network
    assert_eq!(cache.fetch(false).await.unwrap().len(), 10);
    assert!(cache.is_valid());

    // t = 4 min: served from memory
    clock.advance(ChronoDuration::minutes(4));
    assert_eq!(cache.fetch(false).await.unwrap().len(), 10);
    assert_eq!(mock_server.received_requests().await.unwrap().len(), 1);

    // t = 6 min: stale, network again
    clock.advance(ChronoDuration::minutes(2));
    assert!(!cache.is_valid());
    assert_eq!(cache.fetch(false).await.unwrap().len(), 10);
    assert_eq!(mock_server.received_requests().await.unwrap().len(), 2);
    assert!(cache.snapshot().is_consistent());
}

#[tokio::test]
async fn test_force_and_invalidate_bypass_ttl() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/deals"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": "1", "amount": 1}])))
        .expect(3)
        .mount(&mock_server)
        .await;

    let clock = ManualClock::default();
    let cache = deal_cache(&mock_server, &clock);

    cache.fetch(false).await.unwrap();
    cache.fetch(true).await.unwrap();
    cache.invalidate();
    assert_eq!(cache.list(), vec![deal("1", 1)]);
    cache.fetch(false).await.unwrap();
}

#[tokio::test]
async fn test_failed_fetch_keeps_data() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/deals"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": "1", "amount": 1}])))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/deals"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&mock_server)
        .await;

    let clock = ManualClock::default();
    let cache = deal_cache(&mock_server, &clock);
    cache.fetch(false).await.unwrap();

    let err = cache.fetch(true).await.unwrap_err();
    assert!(matches!(err, ApiError::Server { status: 500, .. }));

    let entry = cache.snapshot();
    assert_eq!(entry.list, vec![deal("1", 1)]);
    assert_eq!(entry.error, Some(err));
    assert!(!entry.is_loading);
}

#[tokio::test]
async fn test_update_conflict_rolls_back() {
    let mock_server = MockServer::start().await;
    mount_list(
        &mock_server,
        json!([{"id": "41", "amount": 100}, {"id": "42", "amount": 300}]),
    )
    .await;

    Mock::given(method("PATCH"))
        .and(path("/deals/42"))
        .and(body_json(json!({"amount": 500})))
        .respond_with(
            ResponseTemplate::new(409)
                .set_body_json(json!({"success": false, "message": "Deal was modified"}))
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let clock = ManualClock::default();
    let cache = deal_cache(&mock_server, &clock);
    cache.fetch(false).await.unwrap();
    let before = cache.snapshot();

    let pending = {
        let cache = cache.clone();
        tokio::spawn(async move {
            cache
                .update(&"42".to_string(), patch(json!({"amount": 500})))
                .await
        })
    };

    // Optimistic value visible while the server is deciding.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(cache.get(&"42".to_string()).unwrap().amount, 500);
    assert_eq!(cache.list()[1].amount, 500);

    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(
        err,
        ApiError::Conflict {
            message: "Deal was modified".to_string()
        }
    );

    let after = cache.snapshot();
    assert_eq!(after.list, before.list);
    assert_eq!(after.by_id, before.by_id);
    assert_eq!(cache.get(&"42".to_string()).unwrap().amount, 300);
}

#[tokio::test]
async fn test_update_commits_server_value() {
    let mock_server = MockServer::start().await;
    mount_list(&mock_server, json!([{"id": "42", "amount": 300}])).await;

    Mock::given(method("PATCH"))
        .and(path("/deals/42"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "data": {"id": "42", "amount": 505}
        })))
        .mount(&mock_server)
        .await;

    let clock = ManualClock::default();
    let cache = deal_cache(&mock_server, &clock);
    cache.fetch(false).await.unwrap();

    let updated = cache
        .update(&"42".to_string(), patch(json!({"amount": 500})))
        .await
        .unwrap();

    assert_eq!(updated, deal("42", 505));
    assert_eq!(cache.list(), vec![deal("42", 505)]);
    assert!(cache.snapshot().is_consistent());
}

#[tokio::test]
async fn test_create_confirmed_replaces_provisional_in_place() {
    let mock_server = MockServer::start().await;
    mount_list(&mock_server, json!([{"id": "1", "amount": 10}])).await;

    Mock::given(method("POST"))
        .and(path("/deals"))
        .and(body_json(json!({"id": "tmp-1", "amount": 50})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "success": true,
            "data": {"id": "2", "amount": 50}
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let clock = ManualClock::default();
    let cache = deal_cache(&mock_server, &clock);
    cache.fetch(false).await.unwrap();

    let created = cache.create(deal("tmp-1", 50)).await.unwrap();

    assert_eq!(created, deal("2", 50));
    assert_eq!(cache.list(), vec![deal("2", 50), deal("1", 10)]);
    assert!(cache.get(&"tmp-1".to_string()).is_none());
    assert!(cache.snapshot().is_consistent());
}

#[tokio::test]
async fn test_create_rejected_leaves_no_residue() {
    let mock_server = MockServer::start().await;
    mount_list(&mock_server, json!([{"id": "1", "amount": 10}])).await;

    Mock::given(method("POST"))
        .and(path("/deals"))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({
            "success": false,
            "message": "Invalid deal",
            "errors": [{"field": "amount", "message": "too small"}]
        })))
        .mount(&mock_server)
        .await;

    let clock = ManualClock::default();
    let cache = deal_cache(&mock_server, &clock);
    cache.fetch(false).await.unwrap();
    let before = cache.snapshot();

    let err = cache.create(deal("tmp-1", 0)).await.unwrap_err();
    assert!(matches!(err, ApiError::Validation { .. }));

    let after = cache.snapshot();
    assert_eq!(after.list, before.list);
    assert_eq!(after.by_id, before.by_id);
}

#[tokio::test]
async fn test_refetch_during_create_keeps_confirmed_entity() {
    let mock_server = MockServer::start().await;
    mount_list(&mock_server, json!([{"id": "1", "amount": 10}])).await;

    Mock::given(method("POST"))
        .and(path("/deals"))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(json!({"success": true, "data": {"id": "2", "amount": 50}}))
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let clock = ManualClock::default();
    let cache = deal_cache(&mock_server, &clock);
    cache.fetch(false).await.unwrap();

    let pending = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.create(deal("tmp-1", 50)).await })
    };

    // The server list does not know about the new deal yet.
    tokio::time::sleep(Duration::from_millis(50)).await;
    cache.fetch(true).await.unwrap();
    assert_eq!(cache.list(), vec![deal("tmp-1", 50), deal("1", 10)]);

    pending.await.unwrap().unwrap();
    assert_eq!(cache.list(), vec![deal("2", 50), deal("1", 10)]);
    assert!(cache.snapshot().is_consistent());
}

#[tokio::test]
async fn test_create_with_cached_id_is_refused() {
    let mock_server = MockServer::start().await;
    mount_list(
        &mock_server,
        json!([{"id": "1", "amount": 10}, {"id": "2", "amount": 20}]),
    )
    .await;

    Mock::given(method("POST"))
        .and(path("/deals"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&mock_server)
        .await;

    let clock = ManualClock::default();
    let cache = deal_cache(&mock_server, &clock);
    cache.fetch(false).await.unwrap();

    let err = cache.create(deal("2", 99)).await.unwrap_err();
    assert!(matches!(err, ApiError::InvalidRequest { .. }));
    assert_eq!(cache.list(), vec![deal("1", 10), deal("2", 20)]);
    assert_eq!(cache.get(&"2".to_string()), Some(deal("2", 20)));
}

#[tokio::test]
async fn test_delete_applied_only_after_confirmation() {
    let mock_server = MockServer::start().await;
    mount_list(
        &mock_server,
        json!([{"id": "1", "amount": 10}, {"id": "2", "amount": 20}]),
    )
    .await;

    Mock::given(method("DELETE"))
        .and(path("/deals/1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"success": true}))
                .set_delay(Duration::from_millis(200)),
        )
        .mount(&mock_server)
        .await;

    Mock::given(method("DELETE"))
        .and(path("/deals/2"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&mock_server)
        .await;

    let clock = ManualClock::default();
    let cache = deal_cache(&mock_server, &clock);
    cache.fetch(false).await.unwrap();

    let pending = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.delete(&"1".to_string()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(cache.get(&"1".to_string()).is_some());

    pending.await.unwrap().unwrap();
    assert!(cache.get(&"1".to_string()).is_none());

    let err = cache.delete(&"2".to_string()).await.unwrap_err();
    assert!(matches!(err, ApiError::Forbidden { .. }));
    assert_eq!(cache.list(), vec![deal("2", 20)]);
}

#[tokio::test]
async fn test_cancelled_fetch_applies_nothing() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/deals"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([{"id": "1", "amount": 1}]))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&mock_server)
        .await;

    let clock = ManualClock::default();
    let cache = deal_cache(&mock_server, &clock);

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = cache
        .fetch_with(FetchOptions::default().with_cancel(token))
        .await
        .unwrap_err();

    assert_eq!(err, ApiError::Cancelled);
    let entry = cache.snapshot();
    assert!(entry.list.is_empty());
    assert!(entry.last_fetch.is_none());
    assert!(entry.error.is_none());
    assert!(!entry.is_loading);
}

#[tokio::test]
async fn test_next_page_appends_without_duplicates() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/deals"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "data": {
                "items": [{"id": "a", "amount": 1}, {"id": "b", "amount": 2}],
                "pagination": {"page": 1, "limit": 20, "total": 3, "hasMore": true}
            }
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/deals"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "data": {
                "items": [{"id": "b", "amount": 2}, {"id": "c", "amount": 3}],
                "pagination": {"page": 2, "limit": 20, "total": 3, "hasMore": false}
            }
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let clock = ManualClock::default();
    let cache = deal_cache(&mock_server, &clock);
    cache.fetch(false).await.unwrap();
    assert!(cache.pagination().has_more);

    let all = cache.fetch_next_page().await.unwrap();
    let ids: Vec<&str> = all.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
    assert_eq!(cache.pagination().page, 2);
    assert!(!cache.pagination().has_more);

    // Nothing more to load: no request.
    assert_eq!(cache.fetch_next_page().await.unwrap().len(), 3);
    assert!(cache.snapshot().is_consistent());
}

#[tokio::test]
async fn test_filters_sent_as_query() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/deals"))
        .and(query_param("status", "won"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": "9", "amount": 9}])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let clock = ManualClock::default();
    let cache = deal_cache(&mock_server, &clock);
    cache.set_filters([("status".to_string(), "won".to_string())].into());

    assert_eq!(cache.fetch(false).await.unwrap(), vec![deal("9", 9)]);
}

#[tokio::test]
async fn test_fetch_landing_after_update_keeps_local_write() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/deals"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!([{"id": "42", "amount": 300}])),
        )
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;

    // Second list call is slow and returns the pre-update value.
    Mock::given(method("GET"))
        .and(path("/deals"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([{"id": "42", "amount": 300}]))
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&mock_server)
        .await;

    Mock::given(method("PATCH"))
        .and(path("/deals/42"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "42", "amount": 500})))
        .mount(&mock_server)
        .await;

    let clock = ManualClock::default();
    let cache = deal_cache(&mock_server, &clock);
    cache.fetch(false).await.unwrap();

    let slow_fetch = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.fetch(true).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    cache
        .update(&"42".to_string(), patch(json!({"amount": 500})))
        .await
        .unwrap();
    slow_fetch.await.unwrap().unwrap();

    assert_eq!(cache.get(&"42".to_string()).unwrap().amount, 500);
    assert!(cache.snapshot().is_consistent());
}

#[tokio::test]
async fn test_write_invalidates_dependent_aggregate() {
    let mock_server = MockServer::start().await;
    mount_list(&mock_server, json!([])).await;

    Mock::given(method("GET"))
        .and(path("/dashboard/summary"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "data": {"openDeals": 3}
        })))
        .expect(2)
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/deals"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "7", "amount": 70})))
        .mount(&mock_server)
        .await;

    let clock = ManualClock::default();
    let registry = CacheRegistry::new();
    let deals = deal_cache(&mock_server, &clock);
    let dashboard = ValueCache::with_clock(
        Domain::DASHBOARD,
        TtlClass::Long,
        RestValue::<Value>::new(create_test_client(&mock_server), "/dashboard/summary"),
        Arc::new(clock.clone()),
    );
    deals.register(&registry);
    dashboard.register(&registry);
    registry.link(Domain::DEALS, Domain::DASHBOARD);

    dashboard.fetch(false).await.unwrap();
    dashboard.fetch(false).await.unwrap();
    assert!(dashboard.is_valid());

    deals.create(deal("tmp-7", 70)).await.unwrap();
    assert!(!dashboard.is_valid());
    assert_eq!(dashboard.get(), Some(json!({"openDeals": 3})));

    assert_eq!(
        dashboard.fetch(false).await.unwrap(),
        json!({"openDeals": 3})
    );
}

#[tokio::test]
async fn test_registry_reset_all() {
    let mock_server = MockServer::start().await;
    mount_list(&mock_server, json!([{"id": "1", "amount": 1}])).await;

    let clock = ManualClock::default();
    let registry = CacheRegistry::new();
    let deals = deal_cache(&mock_server, &clock);
    deals.register(&registry);

    deals.fetch(false).await.unwrap();
    registry.invalidate(&[Domain::DEALS]);
    assert!(!deals.is_valid());
    assert_eq!(deals.list().len(), 1);

    registry.reset_all();
    assert!(deals.list().is_empty());
    assert!(deals.snapshot().last_fetch.is_none());
}
