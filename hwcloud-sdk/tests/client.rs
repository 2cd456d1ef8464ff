use std::time::Duration;

use hwcloud_sdk::{Config, ListOpts, ProviderClient, RequestOpts, SdkError, list_all_items};
use reqwest::Method;
use serde_json::json;
use wiremock::matchers::{header, header_exists, method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn aksk_config(uri: &str) -> Config {
    Config::new("cn-north-4")
        .with_aksk("test-ak", "test-sk")
        .with_project_id("p1")
        .with_endpoint("vpc", uri)
        .with_endpoint("evs", uri)
        .with_endpoint("iam", uri)
        .with_endpoint("eps", uri)
        .with_retry_backoff(Duration::from_millis(1))
}

#[tokio::test]
async fn test_aksk_requests_are_signed() {
    init_logger();
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/p1/vpcs/vpc-1"))
        .and(header_exists("x-sdk-date"))
        .and(header("x-project-id", "p1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "vpc": {"id": "vpc-1", "name": "web", "status": "OK"}
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = ProviderClient::new(aksk_config(&mock_server.uri())).unwrap();
    let vpc = client.service_client("vpc", "cn-north-4").await.unwrap();
    let body = vpc.get(&vpc.url("v1/{project_id}/vpcs/vpc-1")).await.unwrap();
    assert_eq!(body["vpc"]["name"], "web");

    let requests = mock_server.received_requests().await.unwrap();
    let authorization = requests[0]
        .headers
        .get("authorization")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(authorization.starts_with("SDK-HMAC-SHA256 Access=test-ak, SignedHeaders="));
    assert!(authorization.contains("x-sdk-date"));
    assert!(authorization.contains("Signature="));
}

#[tokio::test]
async fn test_not_found_carries_error_code() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/p1/vpcs/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error_code": "VPC.0202",
            "error_msg": "Query resource by id missing fail."
        })))
        .mount(&mock_server)
        .await;

    let client = ProviderClient::new(aksk_config(&mock_server.uri())).unwrap();
    let vpc = client.service_client("vpc", "cn-north-4").await.unwrap();
    let err = vpc.get(&vpc.url("v1/{project_id}/vpcs/missing")).await.unwrap_err();

    assert!(err.is_not_found());
    assert_eq!(err.error_code(), Some("VPC.0202"));
    assert!(err.to_string().contains("but got 404"));
}

#[tokio::test]
async fn test_ok_codes_override() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/p1/vpcs"))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({})))
        .mount(&mock_server)
        .await;

    let client = ProviderClient::new(aksk_config(&mock_server.uri())).unwrap();
    let vpc = client.service_client("vpc", "cn-north-4").await.unwrap();
    let err = vpc
        .request(
            Method::POST,
            &vpc.url("v1/{project_id}/vpcs"),
            RequestOpts::json(json!({"vpc": {"name": "web"}})).with_ok_codes(&[200]),
        )
        .await
        .unwrap_err();

    assert_eq!(err.status(), Some(202));
    assert!(!err.is_not_found());
}

#[tokio::test]
async fn test_empty_body_is_null() {
    let mock_server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/v1/p1/vpcs/vpc-1"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&mock_server)
        .await;

    let client = ProviderClient::new(aksk_config(&mock_server.uri())).unwrap();
    let vpc = client.service_client("vpc", "cn-north-4").await.unwrap();
    let body = vpc.delete(&vpc.url("v1/{project_id}/vpcs/vpc-1")).await.unwrap();
    assert!(body.is_null());
}

#[tokio::test]
async fn test_throttled_requests_are_retried() {
    init_logger();
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/p1/vpcs"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(2)
        .expect(2)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v1/p1/vpcs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"vpcs": []})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = ProviderClient::new(aksk_config(&mock_server.uri())).unwrap();
    let vpc = client.service_client("vpc", "cn-north-4").await.unwrap();
    let body = vpc.get(&vpc.url("v1/{project_id}/vpcs")).await.unwrap();
    assert_eq!(body, json!({"vpcs": []}));
}

#[tokio::test]
async fn test_throttling_gives_up_after_max_retries() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/p1/vpcs"))
        .respond_with(ResponseTemplate::new(429))
        .expect(3)
        .mount(&mock_server)
        .await;

    let mut config = aksk_config(&mock_server.uri());
    config.max_retries = 2;
    let client = ProviderClient::new(config).unwrap();
    let vpc = client.service_client("vpc", "cn-north-4").await.unwrap();
    let err = vpc.get(&vpc.url("v1/{project_id}/vpcs")).await.unwrap_err();
    assert_eq!(err.status(), Some(429));
}

#[tokio::test]
async fn test_project_id_lookup_is_cached() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v3/projects"))
        .and(query_param("name", "cn-north-4"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "projects": [
                {"id": "p-sub", "name": "cn-north-4_dev"},
                {"id": "p-42", "name": "cn-north-4"}
            ]
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let mut config = aksk_config(&mock_server.uri());
    config.project_id = None;
    let client = ProviderClient::new(config).unwrap();

    let vpc = client.service_client("vpc", "cn-north-4").await.unwrap();
    assert_eq!(vpc.project_id(), "p-42");
    let evs = client.service_client("evs", "cn-north-4").await.unwrap();
    assert_eq!(evs.project_id(), "p-42");
    assert_eq!(client.project_id("cn-north-4_dev").await.unwrap(), "p-sub");
}

#[tokio::test]
async fn test_missing_project_names_region() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v3/projects"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"projects": []})))
        .mount(&mock_server)
        .await;

    let mut config = aksk_config(&mock_server.uri());
    config.project_id = None;
    let client = ProviderClient::new(config).unwrap();
    let err = client.service_client("vpc", "cn-north-4").await.unwrap_err();
    assert!(err.to_string().contains("no project ID found for region cn-north-4"));
}

#[tokio::test]
async fn test_admin_service_sends_domain_id() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v3/auth/domains"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "domains": [{"id": "d-7", "name": "acme"}]
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v1.0/enterprise-projects"))
        .and(header("x-domain-id", "d-7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"enterprise_projects": []})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = ProviderClient::new(aksk_config(&mock_server.uri())).unwrap();
    let eps = client.service_client("eps", "cn-north-4").await.unwrap();
    eps.get(&eps.url("v1.0/enterprise-projects")).await.unwrap();
}

#[tokio::test]
async fn test_password_auth_issues_token_once() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v3/auth/tokens"))
        .respond_with(
            ResponseTemplate::new(201)
                .insert_header("X-Subject-Token", "tok-123")
                .set_body_json(json!({
                    "token": {"project": {"id": "p-from-token", "name": "cn-north-4"}}
                })),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v1/p-from-token/vpcs"))
        .and(header("x-auth-token", "tok-123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"vpcs": []})))
        .expect(2)
        .mount(&mock_server)
        .await;

    let config = Config::new("cn-north-4")
        .with_password("alice", "secret")
        .with_endpoint("iam", mock_server.uri())
        .with_endpoint("vpc", mock_server.uri());
    let client = ProviderClient::new(config).unwrap();

    for _ in 0..2 {
        let vpc = client.service_client("vpc", "cn-north-4").await.unwrap();
        assert_eq!(vpc.project_id(), "p-from-token");
        vpc.get(&vpc.url("v1/{project_id}/vpcs")).await.unwrap();
    }
}

#[tokio::test]
async fn test_missing_credentials() {
    let err = ProviderClient::new(Config::new("cn-north-4")).unwrap_err();
    assert!(matches!(err, SdkError::MissingCredentials));
}

#[tokio::test]
async fn test_marker_pagination() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/p1/vpcs"))
        .and(query_param_is_missing("marker"))
        .and(query_param("limit", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "vpcs": [{"id": "vpc-1"}, {"id": "vpc-2"}]
        })))
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v1/p1/vpcs"))
        .and(query_param("marker", "vpc-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "vpcs": [{"id": "vpc-3"}]
        })))
        .mount(&mock_server)
        .await;

    let client = ProviderClient::new(aksk_config(&mock_server.uri())).unwrap();
    let vpc = client.service_client("vpc", "cn-north-4").await.unwrap();
    let items = list_all_items(
        &vpc,
        &vpc.url("v1/{project_id}/vpcs"),
        &ListOpts::marker().items_key("vpcs").limit(2),
    )
    .await
    .unwrap();

    let ids: Vec<&str> = items.iter().filter_map(|i| i["id"].as_str()).collect();
    assert_eq!(ids, vec!["vpc-1", "vpc-2", "vpc-3"]);
}

#[tokio::test]
async fn test_page_info_marker_pagination() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v3/p1/vpc/vpcs"))
        .and(query_param_is_missing("marker"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "vpcs": [{"id": "a"}],
            "page_info": {"next_marker": "cursor-2", "current_count": 1}
        })))
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v3/p1/vpc/vpcs"))
        .and(query_param("marker", "cursor-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "vpcs": [{"id": "b"}],
            "page_info": {"current_count": 1}
        })))
        .mount(&mock_server)
        .await;

    let client = ProviderClient::new(aksk_config(&mock_server.uri())).unwrap();
    let vpc = client.service_client("vpcv3", "cn-north-4").await.unwrap();
    let items = list_all_items(&vpc, &vpc.url("v3/{project_id}/vpc/vpcs"), &ListOpts::marker())
        .await
        .unwrap();
    assert_eq!(items.len(), 2);
}

#[tokio::test]
async fn test_offset_pagination_stops_at_count() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v2/p1/cloudvolumes/detail"))
        .and(query_param_is_missing("offset"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "count": 3,
            "volumes": [{"id": "v1"}, {"id": "v2"}]
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v2/p1/cloudvolumes/detail"))
        .and(query_param("offset", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "count": 3,
            "volumes": [{"id": "v3"}]
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = ProviderClient::new(aksk_config(&mock_server.uri())).unwrap();
    let evs = client.service_client("evs", "cn-north-4").await.unwrap();
    let items = list_all_items(
        &evs,
        &evs.url("v2/{project_id}/cloudvolumes/detail"),
        &ListOpts::offset().items_key("volumes"),
    )
    .await
    .unwrap();
    assert_eq!(items.len(), 3);
}

#[tokio::test]
async fn test_page_number_pagination() {
    let mock_server = MockServer::start().await;

    for (page, ids) in [("1", vec!["a", "b"]), ("2", vec!["c"]), ("3", vec![])] {
        let items: Vec<serde_json::Value> = ids.iter().map(|id| json!({"id": id})).collect();
        Mock::given(method("GET"))
            .and(path("/v1/p1/vpcs"))
            .and(query_param("page", page))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"vpcs": items})))
            .expect(1)
            .mount(&mock_server)
            .await;
    }

    let client = ProviderClient::new(aksk_config(&mock_server.uri())).unwrap();
    let vpc = client.service_client("vpc", "cn-north-4").await.unwrap();
    let items = list_all_items(
        &vpc,
        &vpc.url("v1/{project_id}/vpcs"),
        &ListOpts::page_number().items_key("vpcs"),
    )
    .await
    .unwrap();

    let ids: Vec<&str> = items.iter().filter_map(|i| i["id"].as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_timed_out_requests_are_retried() {
    init_logger();
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/p1/vpcs/vpc-1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"vpc": {"id": "vpc-1", "status": "CREATING"}}))
                .set_delay(Duration::from_secs(2)),
        )
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/p1/vpcs/vpc-1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"vpc": {"id": "vpc-1", "status": "OK"}})),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let config = aksk_config(&mock_server.uri()).with_request_timeout(Duration::from_millis(200));
    let client = ProviderClient::new(config).unwrap();
    let vpc = client.service_client("vpc", "cn-north-4").await.unwrap();
    let body = vpc.get(&vpc.url("v1/{project_id}/vpcs/vpc-1")).await.unwrap();
    assert_eq!(body["vpc"]["status"], "OK");
}

#[tokio::test]
async fn test_refused_connections_give_up_after_retries() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let uri = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let mut config = aksk_config(&uri);
    config.max_retries = 1;
    let client = ProviderClient::new(config).unwrap();
    let vpc = client.service_client("vpc", "cn-north-4").await.unwrap();
    let err = vpc.get(&vpc.url("v1/{project_id}/vpcs")).await.unwrap_err();
    assert!(matches!(err, SdkError::Network(_)));
}
