//! BSS (billing) order helpers for yearly/monthly resources.

use serde_json::{Value, json};

use crate::client::ServiceClient;
use crate::error::{SdkError, SdkResult};
use crate::json::path_search_i64;
use crate::waiter::{WaitConf, wait_for_state};

const ORDER_STATUS_CANCELLED: i64 = 2;
const ORDER_STATUS_COMPLETED: i64 = 5;

/// Poll `GET v2/orders/customer-orders/details/{order_id}` until the order
/// is processed. `client` must be a `bss` client.
pub async fn wait_order_complete(
    client: &ServiceClient,
    order_id: &str,
    conf: &WaitConf,
) -> SdkResult<Value> {
    let url = client.build_path(
        "v2/orders/customer-orders/details/{order_id}",
        &[("order_id", order_id)],
    );
    let conf = WaitConf {
        pending: vec!["PENDING".into()],
        target: vec!["COMPLETE".into()],
        ..conf.clone()
    };

    let url = &url;
    wait_for_state(&conf, || async move {
        let order = client.get(url).await?;
        let status = path_search_i64("order_info.status", &order)
            .ok_or_else(|| SdkError::missing(format!("order_info.status of order {}", order_id)))?;
        match status {
            ORDER_STATUS_COMPLETED => Ok((order, "COMPLETE".to_string())),
            ORDER_STATUS_CANCELLED => Err(SdkError::OrderFailed {
                order_id: order_id.to_string(),
                reason: "order was cancelled".to_string(),
            }),
            _ => Ok((order, "PENDING".to_string())),
        }
    })
    .await
}

/// Unsubscribe prepaid resources; the resources are released right away.
pub async fn unsubscribe_prepaid_resources(
    client: &ServiceClient,
    resource_ids: &[String],
) -> SdkResult<Value> {
    let url = client.url("v2/orders/subscriptions/resources/unsubscribe");
    let body = json!({
        "resource_ids": resource_ids,
        "unsubscribe_type": 1,
    });
    log::info!("unsubscribing prepaid resources {:?}", resource_ids);
    client.post(&url, body).await
}
