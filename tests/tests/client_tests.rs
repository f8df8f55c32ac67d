use axum::http::StatusCode;
use druid_client::{
    ClientConfig, ConnectionPool, DruidClient, DruidError, HttpClientConfig, Query,
};
use druid_core::{ScanQuery, ScanResultFormat};
use druid_e2e_tests::common::{init_tracing, plain_rows, wikiticker_scan, wikiticker_select};
use druid_e2e_tests::mock_broker::{
    unused_local_host, MockBroker, MockResponse, ResetBroker, SlowBroker, TruncatedBroker,
};
use futures::{future, StreamExt, TryStreamExt};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

async fn client_for(broker: &MockBroker) -> DruidClient {
    init_tracing();
    DruidClient::create(broker.host())
        .await
        .expect("mock broker address resolves")
}

#[tokio::test]
async fn test_two_row_select() {
    let broker = MockBroker::start(MockResponse::ok(
        r#"[{"page":"A","user":"u1"},{"page":"B","user":"u2"}]"#,
    ))
    .await
    .unwrap();
    let client = client_for(&broker).await;

    let rows = client
        .execute(&wikiticker_select(50).into())
        .await
        .unwrap();
    let query_id = rows.query_id().to_string();
    let rows = rows.collect_rows().await.unwrap();

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get_str("page"), Some("A"));
    assert_eq!(rows[0].get_str("user"), Some("u1"));
    assert_eq!(rows[1].get_str("page"), Some("B"));
    assert_eq!(rows[1].get_str("user"), Some("u2"));

    let requests = broker.requests();
    assert_eq!(requests.len(), 1);
    let sent = &requests[0];
    assert_eq!(sent["queryType"], "select");
    assert_eq!(sent["dataSource"], "wikiticker");
    assert_eq!(sent["dimensions"], json!(["page", "user"]));
    assert_eq!(sent["pagingSpec"]["threshold"], 50);
    assert_eq!(sent["filter"]["type"], "and");
    assert_eq!(sent["filter"]["fields"][0]["dimension"], "countryName");
    assert_eq!(sent["context"]["queryId"], query_id.as_str());
}

#[tokio::test]
async fn test_rows_arrive_in_order_across_chunks() {
    let body = plain_rows(250);
    let broker = MockBroker::start(MockResponse::chunked(&body, 7, Duration::ZERO))
        .await
        .unwrap();
    let client = client_for(&broker).await;

    let mut rows = client.execute(&wikiticker_scan(250)).await.unwrap();
    let mut index = 0;
    while let Some(row) = rows.try_next().await.unwrap() {
        assert_eq!(row.get_str("page"), Some(format!("page-{}", index).as_str()));
        index += 1;
    }
    assert_eq!(index, 250);
    assert_eq!(rows.rows_read(), 250);

    let snapshot = client.metrics().snapshot();
    assert_eq!(snapshot.queries_total, 1);
    assert_eq!(snapshot.elements_decoded_total, 250);
    assert_eq!(snapshot.streams_completed_total, 1);
    assert_eq!(snapshot.bytes_received_total, body.len() as u64);
}

#[tokio::test]
async fn test_first_row_available_before_body_completes() {
    let broker = MockBroker::start(MockResponse::Stalled {
        first: r#"[{"page":"A","user":"u1"},"#.to_string(),
    })
    .await
    .unwrap();
    let client = client_for(&broker).await;

    let mut rows = client.execute(&wikiticker_scan(10)).await.unwrap();
    let first = tokio::time::timeout(Duration::from_secs(5), rows.next())
        .await
        .expect("first row should not wait for the rest of the body")
        .unwrap()
        .unwrap();
    assert_eq!(first.get_str("page"), Some("A"));

    drop(rows);
    let snapshot = client.metrics().snapshot();
    assert_eq!(snapshot.streams_abandoned_total, 1);
    assert_eq!(snapshot.streams_completed_total, 0);

    broker.set_response(MockResponse::ok(plain_rows(3)));
    let rows = client
        .execute(&wikiticker_scan(3))
        .await
        .unwrap()
        .collect_rows()
        .await
        .unwrap();
    assert_eq!(rows.len(), 3);
}

#[tokio::test]
async fn test_empty_result() {
    let broker = MockBroker::start(MockResponse::ok("[]")).await.unwrap();
    let client = client_for(&broker).await;

    let rows = client
        .execute(&wikiticker_scan(10))
        .await
        .unwrap()
        .collect_rows()
        .await
        .unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn test_broker_error_surfaces_as_query_error() {
    let broker = MockBroker::start(MockResponse::error(
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({
            "error": "Unknown exception",
            "errorMessage": "Segment scan failed",
            "errorClass": "java.lang.RuntimeException",
            "host": "historical-1:8083"
        })
        .to_string(),
    ))
    .await
    .unwrap();
    let client = client_for(&broker).await;

    match client.execute(&wikiticker_scan(10)).await {
        Err(DruidError::Query(failure)) => {
            assert_eq!(failure.status, Some(500));
            assert_eq!(failure.message(), "Segment scan failed");
            assert_eq!(failure.host.as_deref(), Some("historical-1:8083"));
        }
        other => panic!("expected query error, got {:?}", other.map(|_| ())),
    }
    assert_eq!(client.metrics().snapshot().errors_total, 1);
}

#[tokio::test]
async fn test_plain_text_rejection() {
    let broker = MockBroker::start(MockResponse::error(
        StatusCode::BAD_REQUEST,
        "Unable to parse query\n",
    ))
    .await
    .unwrap();
    let client = client_for(&broker).await;

    let err = client.execute(&wikiticker_scan(10)).await.err().unwrap();
    assert_eq!(err.status(), Some(400));
    assert!(err.to_string().contains("Unable to parse query"));
    assert!(!err.is_retriable());
}

#[tokio::test]
async fn test_truncated_body_is_decode_error() {
    let partial = r#"[{"page":"A","user":"u1"},{"page":"B","us"#;
    let broker = TruncatedBroker::start(partial, partial.len() + 500)
        .await
        .unwrap();
    init_tracing();
    let client = DruidClient::create(broker.host()).await.unwrap();

    let mut rows = client.execute(&wikiticker_scan(10)).await.unwrap();
    let first = rows.try_next().await.unwrap().unwrap();
    assert_eq!(first.get_str("page"), Some("A"));

    let err = rows.try_next().await.err().unwrap();
    assert!(matches!(err, DruidError::Decode(_)), "got {:?}", err);
    assert!(rows.next().await.is_none());
}

#[tokio::test]
async fn test_connection_reset_mid_body_is_network_error() {
    init_tracing();
    let broker = ResetBroker::start(r#"[{"page":"A"},"#).await.unwrap();
    let client = DruidClient::create(broker.host()).await.unwrap();

    let mut rows = client.execute(&wikiticker_scan(10)).await.unwrap();
    let first = rows.try_next().await.unwrap().unwrap();
    assert_eq!(first.get_str("page"), Some("A"));

    let err = rows.try_next().await.err().unwrap();
    assert!(matches!(err, DruidError::Network(_)), "got {:?}", err);
    assert!(err.is_retriable());
}

#[tokio::test]
async fn test_missing_closing_bracket_is_decode_error() {
    let broker = MockBroker::start(MockResponse::ok(r#"[{"page":"A"},{"page":"B"}"#))
        .await
        .unwrap();
    let client = client_for(&broker).await;

    let result = client
        .execute(&wikiticker_scan(10))
        .await
        .unwrap()
        .collect_rows()
        .await;
    assert!(matches!(result, Err(DruidError::Decode(_))));
}

#[tokio::test]
async fn test_malformed_element_is_decode_error() {
    let broker = MockBroker::start(MockResponse::ok(r#"[{"page":"A"}, {page: B}]"#))
        .await
        .unwrap();
    let client = client_for(&broker).await;

    let mut rows = client.execute(&wikiticker_scan(10)).await.unwrap();
    assert!(rows.try_next().await.unwrap().is_some());
    assert!(matches!(rows.try_next().await, Err(DruidError::Decode(_))));
}

#[tokio::test]
async fn test_invalid_query_is_never_sent() {
    let broker = MockBroker::start(MockResponse::ok("[]")).await.unwrap();
    let client = client_for(&broker).await;

    let mut select = wikiticker_select(10);
    select.data_source.clear();

    let result = client.execute(&select.into()).await;
    assert!(matches!(result, Err(DruidError::Query(_))));

    let result = client
        .execute_value(json!({"queryType": "select", "dataSource": "wikiticker"}))
        .await;
    assert!(matches!(result, Err(DruidError::Query(_))));

    assert_eq!(broker.request_count(), 0);
}

#[tokio::test]
async fn test_execute_after_close_fails_without_request() {
    let broker = MockBroker::start(MockResponse::ok("[]")).await.unwrap();
    let client = client_for(&broker).await;

    client.close();
    assert!(client.is_closed());
    assert!(matches!(
        client.execute(&wikiticker_scan(1)).await,
        Err(DruidError::ClientClosed)
    ));
    assert_eq!(broker.request_count(), 0);
}

#[tokio::test]
async fn test_owned_pool_released_exactly_once() {
    let broker = MockBroker::start(MockResponse::ok(plain_rows(1))).await.unwrap();
    let client = client_for(&broker).await;
    let pool = client.pool().clone();

    client.execute(&wikiticker_scan(1)).await.unwrap().collect_rows().await.unwrap();

    client.close();
    client.close();
    drop(client);

    assert!(pool.is_closed());
    assert_eq!(pool.release_count(), 1);
}

#[tokio::test]
async fn test_shared_pool_outlives_clients() {
    init_tracing();
    let first_broker = MockBroker::start(MockResponse::ok(plain_rows(2))).await.unwrap();
    let second_broker = MockBroker::start(MockResponse::ok(plain_rows(3))).await.unwrap();

    let pool = ConnectionPool::new(&HttpClientConfig::default()).unwrap();
    let first = DruidClient::create_shared(first_broker.host(), pool.clone()).unwrap();
    let second = DruidClient::create_shared(second_broker.host(), pool.clone()).unwrap();

    let first_query = wikiticker_scan(2);
    let second_query = wikiticker_scan(3);
    let (a, b) = tokio::join!(
        first.execute(&first_query),
        second.execute(&second_query)
    );
    assert_eq!(a.unwrap().collect_rows().await.unwrap().len(), 2);
    assert_eq!(b.unwrap().collect_rows().await.unwrap().len(), 3);

    first.close();
    drop(second);
    assert!(!pool.is_closed());
    assert_eq!(pool.release_count(), 0);

    let third = DruidClient::create_shared(first_broker.host(), pool.clone()).unwrap();
    let rows = third
        .execute(&wikiticker_scan(2))
        .await
        .unwrap()
        .collect_rows()
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(first_broker.request_count(), 2);
}

#[tokio::test]
async fn test_concurrent_queries_from_one_client() {
    let broker = MockBroker::start(MockResponse::chunked(
        &plain_rows(40),
        64,
        Duration::from_millis(1),
    ))
    .await
    .unwrap();
    let client = client_for(&broker).await;
    let query = wikiticker_scan(40);

    let results = future::join_all((0..8).map(|_| async {
        client.execute(&query).await?.collect_rows().await
    }))
    .await;

    for rows in results {
        assert_eq!(rows.unwrap().len(), 40);
    }
    assert_eq!(broker.request_count(), 8);

    let ids: std::collections::HashSet<String> = broker
        .requests()
        .iter()
        .map(|q| q["context"]["queryId"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(ids.len(), 8);
}

#[tokio::test]
async fn test_connection_count_bounds_parallel_queries() {
    init_tracing();
    let broker = SlowBroker::start(&plain_rows(3), Duration::from_millis(200))
        .await
        .unwrap();

    let mut config = ClientConfig::for_broker(broker.host());
    config.http.num_connections = 2;
    let client = DruidClient::create_with_config(config).await.unwrap();
    let query = wikiticker_scan(3);

    let results = future::join_all((0..8).map(|_| async {
        client.execute(&query).await?.collect_rows().await
    }))
    .await;

    for rows in results {
        assert_eq!(rows.unwrap().len(), 3);
    }
    assert_eq!(broker.request_count(), 8);
    assert!(
        broker.max_in_flight() <= 2,
        "{} requests served at once over {} connections",
        broker.max_in_flight(),
        broker.connections()
    );
    assert_eq!(client.pool().available_connections(), 2);
}

#[tokio::test]
async fn test_abandoned_stream_frees_its_connection_slot() {
    let broker = MockBroker::start(MockResponse::Stalled {
        first: r#"[{"page":"A"},"#.to_string(),
    })
    .await
    .unwrap();

    let mut config = ClientConfig::for_broker(broker.host());
    config.http.num_connections = 1;
    init_tracing();
    let client = DruidClient::create_with_config(config).await.unwrap();

    let mut rows = client.execute(&wikiticker_scan(10)).await.unwrap();
    assert!(rows.try_next().await.unwrap().is_some());
    assert_eq!(client.pool().available_connections(), 0);

    drop(rows);
    assert_eq!(client.pool().available_connections(), 1);

    broker.set_response(MockResponse::ok(plain_rows(2)));
    let rows = tokio::time::timeout(Duration::from_secs(5), async {
        client.execute(&wikiticker_scan(2)).await?.collect_rows().await
    })
    .await
    .expect("second query should not wait on the abandoned one")
    .unwrap();
    assert_eq!(rows.len(), 2);
}

#[tokio::test]
async fn test_select_pages_carry_paging_identifiers() {
    let page = json!([{
        "timestamp": "2015-09-12T00:46:58.771Z",
        "result": {
            "pagingIdentifiers": {"wikiticker_2015-09-12_v1_0": 1},
            "dimensions": ["page", "user"],
            "metrics": [],
            "events": [
                {"segmentId": "wikiticker_2015-09-12_v1_0", "offset": 0,
                 "event": {"timestamp": "2015-09-12T00:46:58.771Z", "page": "A", "user": "u1"}},
                {"segmentId": "wikiticker_2015-09-12_v1_0", "offset": 1,
                 "event": {"timestamp": "2015-09-12T00:47:00.496Z", "page": "B", "user": "u2"}}
            ]
        }
    }]);
    let broker = MockBroker::start(MockResponse::ok(page.to_string())).await.unwrap();
    let client = client_for(&broker).await;

    let select = wikiticker_select(2);
    let mut rows = client.execute(&select.clone().into()).await.unwrap();
    let mut pages = Vec::new();
    while let Some(row) = rows.try_next().await.unwrap() {
        let position = row.position.clone().unwrap();
        assert_eq!(position.segment_id, "wikiticker_2015-09-12_v1_0");
        pages.push(row.get_str("page").unwrap().to_string());
    }
    assert_eq!(pages, vec!["A", "B"]);

    let next = select.next_page(rows.paging_identifiers());
    broker.set_response(MockResponse::ok("[]"));
    client.execute(&next.into()).await.unwrap().collect_rows().await.unwrap();

    let requests = broker.requests();
    assert_eq!(
        requests[1]["pagingSpec"]["pagingIdentifiers"]["wikiticker_2015-09-12_v1_0"],
        1
    );
    assert_eq!(requests[1]["pagingSpec"]["fromNext"], true);
    assert_ne!(requests[0]["context"]["queryId"], requests[1]["context"]["queryId"]);
}

#[tokio::test]
async fn test_compacted_scan_batches() {
    let batches = json!([
        {"segmentId": "seg-1", "columns": ["page", "user"], "events": [["A", "u1"], ["B", "u2"]]},
        {"segmentId": "seg-1", "columns": ["page", "user"], "events": [["C", "u3"]]}
    ]);
    let broker = MockBroker::start(MockResponse::ok(batches.to_string())).await.unwrap();
    let client = client_for(&broker).await;

    let query: Query = ScanQuery::builder()
        .data_source("wikiticker")
        .interval("2015-09-12/2015-09-13".parse().unwrap())
        .columns(["page", "user"])
        .result_format(ScanResultFormat::CompactedList)
        .build()
        .unwrap()
        .into();

    let rows = client.execute(&query).await.unwrap().collect_rows().await.unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[2].get_str("user"), Some("u3"));
    assert_eq!(rows[2].position.as_ref().unwrap().offset, 2);
    assert_eq!(broker.requests()[0]["resultFormat"], "compactedList");
}

#[tokio::test]
async fn test_typed_rows() {
    #[derive(Debug, Deserialize, PartialEq)]
    struct Edit {
        page: String,
        user: String,
    }

    let broker = MockBroker::start(MockResponse::ok(plain_rows(3))).await.unwrap();
    let client = client_for(&broker).await;

    let edits: Vec<Edit> = client
        .execute_typed::<Edit>(&wikiticker_scan(3))
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();

    assert_eq!(
        edits[2],
        Edit {
            page: "page-2".to_string(),
            user: "user-2".to_string()
        }
    );
}

#[tokio::test]
async fn test_unresolvable_host_is_connection_error() {
    init_tracing();
    let result = DruidClient::create("druid-broker.invalid:8082").await;
    match result {
        Err(err @ DruidError::Connection(_)) => assert!(err.is_retriable()),
        other => panic!("expected connection error, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_refused_connection_is_network_error() {
    init_tracing();
    let host = unused_local_host().await.unwrap();
    let client = DruidClient::create(host).await.unwrap();

    let result = client.execute(&wikiticker_scan(1)).await;
    assert!(matches!(result, Err(DruidError::Network(_))));
}

#[tokio::test]
async fn test_read_timeout_is_network_error() {
    init_tracing();
    let broker = MockBroker::start(MockResponse::Stalled {
        first: "[".to_string(),
    })
    .await
    .unwrap();

    let mut config = ClientConfig::for_broker(broker.host());
    config.http.read_timeout_ms = 200;
    let client = DruidClient::create_with_config(config).await.unwrap();

    let result = client
        .execute(&wikiticker_scan(1))
        .await
        .unwrap()
        .collect_rows()
        .await;
    assert!(matches!(result, Err(DruidError::Network(_))), "got {:?}", result.map(|r| r.len()));
}
