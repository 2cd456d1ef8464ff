use std::time::Duration;

use hwcloud_core::provider::Provider;
use hwcloud_core::resource::{Resource, Value};
use hwcloud_provider::{HuaweiCloudProvider, WaitSettings};
use hwcloud_sdk::Config;
use serde_json::json;
use wiremock::matchers::{method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn provider(uri: &str) -> HuaweiCloudProvider {
    let endpoint = format!("{}/", uri);
    let config = Config::new("cn-north-4")
        .with_aksk("test-ak", "test-sk")
        .with_project_id("p1")
        .with_endpoint("vpc", endpoint.clone())
        .with_endpoint("evs", endpoint.clone())
        .with_endpoint("elb", endpoint)
        .with_retry_backoff(Duration::from_millis(1));
    HuaweiCloudProvider::new(config)
        .unwrap()
        .with_wait_settings(WaitSettings::immediate())
}

#[tokio::test]
async fn test_vpcs_filters_and_identifier() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v3/p1/vpc/vpcs"))
        .and(query_param("name", "main"))
        .and(query_param_is_missing("marker"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "vpcs": [
                {"id": "vpc-1", "name": "main", "cidr": "192.168.0.0/16", "status": "OK", "tags": []},
                {"id": "vpc-2", "name": "main", "cidr": "10.0.0.0/8", "status": "CREATING", "tags": []}
            ],
            "page_info": {"current_count": 2}
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let resource = Resource::data_source("vpcs", "main")
        .with_attribute("name", "main")
        .with_attribute("status", "OK");

    let provider = provider(&mock_server.uri());
    let state = provider.read_data_source(&resource).await.unwrap();

    assert!(state.exists);
    let identifier = state.identifier.clone().unwrap();
    assert!(uuid::Uuid::parse_str(&identifier).is_ok());
    assert_eq!(state.attributes["region"], Value::string("cn-north-4"));
    assert_eq!(state.attributes["name"], Value::string("main"));

    let vpcs = state.attributes["vpcs"].as_list().unwrap();
    assert_eq!(vpcs.len(), 1);
    assert_eq!(vpcs[0].as_map().unwrap()["id"], Value::string("vpc-1"));
}

#[tokio::test]
async fn test_load_balancers_follow_next_marker() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v3/p1/elb/loadbalancers"))
        .and(query_param("marker", "lb-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "loadbalancers": [{"id": "lb-2", "name": "api", "vpc_id": "vpc-1"}],
            "page_info": {"current_count": 1}
        })))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v3/p1/elb/loadbalancers"))
        .and(query_param("vpc_id", "vpc-1"))
        .and(query_param_is_missing("marker"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "loadbalancers": [{"id": "lb-1", "name": "web", "vpc_id": "vpc-1"}],
            "page_info": {"next_marker": "lb-1", "current_count": 1}
        })))
        .mount(&mock_server)
        .await;

    let resource = Resource::data_source("elb_loadbalancers", "all").with_attribute("vpc_id", "vpc-1");
    let provider = provider(&mock_server.uri());
    let state = provider.read_data_source(&resource).await.unwrap();

    let ids: Vec<&str> = state.attributes["loadbalancers"]
        .as_list()
        .unwrap()
        .iter()
        .filter_map(|lb| lb.as_map().and_then(|m| m["id"].as_str()))
        .collect();
    assert_eq!(ids, vec!["lb-1", "lb-2"]);
}

#[tokio::test]
async fn test_volumes_use_offset_pagination() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v2/p1/cloudvolumes/detail"))
        .and(query_param("status", "in-use"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "volumes": [
                {"id": "vol-1", "name": "data", "size": 40, "status": "in-use",
                 "attachments": [{"attachment_id": "a1", "server_id": "ecs-1", "device": "/dev/vdb"}]},
                {"id": "vol-2", "name": "logs", "size": 80, "status": "in-use",
                 "attachments": [{"attachment_id": "a2", "server_id": "ecs-2", "device": "/dev/vdb"}]}
            ],
            "count": 2
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let resource = Resource::data_source("evs_volumes", "attached")
        .with_attribute("status", "in-use")
        .with_attribute("server_id", "ecs-2");
    let provider = provider(&mock_server.uri());
    let state = provider.read_data_source(&resource).await.unwrap();

    let volumes = state.attributes["volumes"].as_list().unwrap();
    assert_eq!(volumes.len(), 1);
    let volume = volumes[0].as_map().unwrap();
    assert_eq!(volume["id"], Value::string("vol-2"));
    assert_eq!(volume["size"], Value::Int(80));
}

#[tokio::test]
async fn test_unknown_data_source() {
    let mock_server = MockServer::start().await;
    let provider = provider(&mock_server.uri());

    let err = provider
        .read_data_source(&Resource::data_source("rds_instances", "all"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Unknown data source type: rds_instances"));
}
