//! End-to-end query behavior against a mock backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use nimbus_client::{
    Client, ClientConfig, EachOptions, ErrorCode, Query, Record, RequestOptions,
};
use serde_json::{Value, json};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

fn client_for(server: &MockServer) -> Client {
    let config = ClientConfig::builder("app-id")
        .client_key("js-key")
        .server_url(server.uri())
        .build();
    Client::new(config).unwrap()
}

fn query_params(request: &Request) -> HashMap<String, String> {
    request.url.query_pairs().into_owned().collect()
}

fn where_of(request: &Request) -> Value {
    serde_json::from_str(&query_params(request)["where"]).unwrap()
}

/// Serves `total` records ordered by id, honoring `limit` and an
/// `objectId > cursor` filter.
struct PagedRecords {
    ids: Vec<String>,
    default_page: usize,
    fail_after_page: Option<usize>,
    pages_served: Mutex<usize>,
}

impl PagedRecords {
    fn new(total: usize, default_page: usize) -> Self {
        Self {
            ids: (0..total).map(|i| format!("obj{i:05}")).collect(),
            default_page,
            fail_after_page: None,
            pages_served: Mutex::new(0),
        }
    }
}

impl Respond for PagedRecords {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let mut served = self.pages_served.lock().unwrap();
        if self.fail_after_page.is_some_and(|n| *served >= n) {
            return ResponseTemplate::new(500).set_body_json(json!({
                "code": 1,
                "error": "internal error",
            }));
        }
        *served += 1;

        let params = query_params(request);
        let limit = params
            .get("limit")
            .map(|l| l.parse::<usize>().unwrap())
            .unwrap_or(self.default_page);
        let filter = where_of(request);
        let after = filter["objectId"]["$gt"].as_str().map(str::to_string);

        let results: Vec<Value> = self
            .ids
            .iter()
            .filter(|id| after.as_ref().is_none_or(|cursor| id.as_str() > cursor.as_str()))
            .take(limit)
            .map(|id| json!({"objectId": id, "score": 1}))
            .collect();
        ResponseTemplate::new(200).set_body_json(json!({ "results": results }))
    }
}

#[tokio::test]
async fn each_walks_all_records_in_batches() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/classes/GameScore"))
        .respond_with(PagedRecords::new(250, 100))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    Query::new("GameScore")
        .each(
            &client,
            EachOptions {
                batch_size: Some(100),
                ..EachOptions::default()
            },
            move |record: Record| sink.lock().unwrap().push(record.id().unwrap().to_string()),
        )
        .await
        .unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 250);
    assert_eq!(seen.first().map(String::as_str), Some("obj00000"));
    assert_eq!(seen.last().map(String::as_str), Some("obj00249"));

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 3);
    for request in &requests {
        let params = query_params(request);
        assert_eq!(params["order"], "objectId");
        assert_eq!(params["limit"], "100");
    }
    assert_eq!(where_of(&requests[0]), json!({}));
    assert_eq!(
        where_of(&requests[2]),
        json!({"objectId": {"$gt": "obj00199"}})
    );
}

#[tokio::test]
async fn each_uses_server_page_size_until_empty_batch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/classes/GameScore"))
        .respond_with(PagedRecords::new(250, 100))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let count = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&count);

    Query::new("GameScore")
        .each(&client, EachOptions::default(), move |_| {
            *counter.lock().unwrap() += 1;
        })
        .await
        .unwrap();

    assert_eq!(*count.lock().unwrap(), 250);
    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 4);
    assert!(!query_params(&requests[0]).contains_key("limit"));
}

#[tokio::test]
async fn each_stops_on_first_failed_batch() {
    let server = MockServer::start().await;
    let mut responder = PagedRecords::new(250, 100);
    responder.fail_after_page = Some(1);
    Mock::given(method("GET"))
        .and(path("/classes/GameScore"))
        .respond_with(responder)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let count = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&count);

    let err = Query::new("GameScore")
        .each(
            &client,
            EachOptions {
                batch_size: Some(100),
                ..EachOptions::default()
            },
            move |_| *counter.lock().unwrap() += 1,
        )
        .await
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::InternalServerError);
    assert_eq!(*count.lock().unwrap(), 100);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn range_and_sort_go_out_as_one_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/classes/GameScore"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [
                {"objectId": "a", "score": 1001},
                {"objectId": "b", "score": 1500},
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let records = Query::new("GameScore")
        .greater_than("score", 1000)
        .ascending("score")
        .find(&client, RequestOptions::default())
        .await
        .unwrap();

    let ids: Vec<_> = records.iter().filter_map(|r| r.id()).collect();
    assert_eq!(ids, vec!["a", "b"]);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(where_of(&requests[0]), json!({"score": {"$gt": 1000}}));
    assert_eq!(query_params(&requests[0])["order"], "score");
}

#[tokio::test]
async fn or_of_two_queries_is_one_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/classes/Player"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": []})))
        .expect(1)
        .mount(&server)
        .await;

    let mut winners = Query::new("Player");
    winners.greater_than("wins", 150);
    let mut losers = Query::new("Player");
    losers.less_than("wins", 5);

    let client = client_for(&server);
    let records = Query::or(vec![winners, losers])
        .unwrap()
        .find(&client, RequestOptions::default())
        .await
        .unwrap();
    assert!(records.is_empty());

    let requests = server.received_requests().await.unwrap();
    assert_eq!(
        where_of(&requests[0]),
        json!({"$or": [{"wins": {"$gt": 150}}, {"wins": {"$lt": 5}}]})
    );
}

#[tokio::test]
async fn conflicting_equalities_reach_the_server() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/classes/Thing"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "code": 102,
            "error": "bad query",
        })))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = Query::new("Thing")
        .equal_to("x", 1)
        .equal_to("x", 2)
        .find(&client, RequestOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::InvalidQuery);
    assert_eq!(err.message(), "bad query");

    let requests = server.received_requests().await.unwrap();
    let filter = where_of(&requests[0]);
    assert_eq!(filter["x"], json!(1));
    assert_eq!(filter["$and"], json!([{"x": 2}]));
}

#[tokio::test]
async fn first_get_and_count() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/classes/GameScore"))
        .respond_with(|request: &Request| {
            let params: HashMap<String, String> = request.url.query_pairs().into_owned().collect();
            if params.get("count").map(String::as_str) == Some("1") {
                return ResponseTemplate::new(200)
                    .set_body_json(json!({"results": [], "count": 42}));
            }
            let filter: Value = serde_json::from_str(&params["where"]).unwrap();
            if filter["objectId"] == json!("missing") {
                return ResponseTemplate::new(200).set_body_json(json!({"results": []}));
            }
            ResponseTemplate::new(200).set_body_json(json!({
                "results": [{"objectId": "top", "score": 9000}]
            }))
        })
        .mount(&server)
        .await;

    let client = client_for(&server);
    let mut query = Query::new("GameScore");
    query.descending("score");

    let first = query
        .first(&client, RequestOptions::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.get("score"), Some(&json!(9000)));

    let got = query
        .get("top", &client, RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(got.id(), Some("top"));

    let err = query
        .get("missing", &client, RequestOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ObjectNotFound);

    let count = query
        .count(&client, RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(count, 42);

    let requests = server.received_requests().await.unwrap();
    let first_params = query_params(&requests[0]);
    assert_eq!(first_params["limit"], "1");
    let count_params = query_params(&requests[3]);
    assert_eq!(count_params["count"], "1");
    assert_eq!(count_params["limit"], "0");
    assert!(!count_params.contains_key("order"));
}

#[tokio::test]
async fn callbacks_observe_query_outcome() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/classes/GameScore"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{"objectId": "a"}]
        })))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let (tx, rx) = tokio::sync::oneshot::channel();
    let deferred = Query::new("GameScore")
        .find(&client, RequestOptions::default())
        .with_callbacks(
            nimbus_client::Callbacks::new().success(move |records: &Vec<Record>| {
                let _ = tx.send(records.len());
            }),
        );

    let records = deferred.await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(rx.await.unwrap(), 1);
}
