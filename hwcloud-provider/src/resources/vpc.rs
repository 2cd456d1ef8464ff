//! VPC: `v1/{project_id}/vpcs`

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use hwcloud_core::schema::{AttributeSchema, AttributeType, ResourceSchema, types};
use hwcloud_sdk::json::{path_search_str, remove_nil};
use hwcloud_sdk::tags::update_resource_tags;
use hwcloud_sdk::{SdkError, WaitConf, wait_for_state};
use serde_json::{Value as Json, json};

use super::{
    ResourceContext, ResourceHandler, enterprise_project_attribute, fetch_tags, region_attribute,
    tags_attribute,
};
use crate::error::{HandlerError, HandlerResult};
use crate::utils::{Attributes, get_str, get_string, get_tags, has_change, set_from, tags_to_value};

const TAGS_PATH: &str = "v2.0/{project_id}/vpcs/{id}";

pub struct Vpc;

fn tags_path(id: &str) -> String {
    TAGS_PATH.replace("{id}", id)
}

fn build_create_body(attrs: &Attributes, enterprise_project_id: Option<&str>) -> Json {
    remove_nil(json!({
        "vpc": {
            "name": get_str(attrs, "name"),
            "cidr": get_str(attrs, "cidr"),
            "description": get_str(attrs, "description"),
            "enterprise_project_id": enterprise_project_id,
        }
    }))
}

fn flatten(body: &Json) -> Attributes {
    let mut attrs = Attributes::new();
    set_from(&mut attrs, "name", "vpc.name", body);
    set_from(&mut attrs, "cidr", "vpc.cidr", body);
    set_from(&mut attrs, "description", "vpc.description", body);
    set_from(&mut attrs, "enterprise_project_id", "vpc.enterprise_project_id", body);
    set_from(&mut attrs, "status", "vpc.status", body);
    attrs
}

#[async_trait]
impl ResourceHandler for Vpc {
    fn type_name(&self) -> &'static str {
        "vpc"
    }

    fn schema(&self) -> ResourceSchema {
        ResourceSchema::new("vpc")
            .with_description("Virtual Private Cloud")
            .attribute(region_attribute())
            .attribute(AttributeSchema::new("name", types::resource_name()).required())
            .attribute(AttributeSchema::new("cidr", types::cidr()).required())
            .attribute(AttributeSchema::new("description", AttributeType::String))
            .attribute(enterprise_project_attribute())
            .attribute(tags_attribute())
            .attribute(AttributeSchema::new("status", AttributeType::String).computed())
    }

    async fn create(&self, ctx: &ResourceContext<'_>, attrs: &Attributes) -> HandlerResult<String> {
        let client = ctx.service("vpc").await?;
        let body = build_create_body(attrs, ctx.enterprise_project_id.as_deref());
        let resp = client.post(&client.url("v1/{project_id}/vpcs"), body).await?;
        let id = path_search_str("vpc.id", &resp).ok_or_else(|| HandlerError::missing("vpc.id"))?;
        log::info!("VPC ID: {}", id);

        let url = client.build_path("v1/{project_id}/vpcs/{id}", &[("id", &id)]);
        let conf = ctx.wait(
            WaitConf::new(&["CREATING"], &["OK"], Duration::from_secs(600))
                .delay(Duration::from_secs(5))
                .poll_interval(Duration::from_secs(3)),
        );
        let (client_ref, url_ref) = (&client, &url);
        wait_for_state(&conf, || async move {
            let body = client_ref.get(url_ref).await?;
            let status = path_search_str("vpc.status", &body).unwrap_or_default();
            Ok::<_, SdkError>((body, status))
        })
        .await?;

        let tags = get_tags(attrs);
        if !tags.is_empty() {
            let tag_client = ctx.service("networkv2").await?;
            update_resource_tags(&tag_client, &tags_path(&id), &BTreeMap::new(), &tags).await?;
        }
        Ok(id)
    }

    async fn read(
        &self,
        ctx: &ResourceContext<'_>,
        id: &str,
        _attrs: &Attributes,
    ) -> HandlerResult<Option<Attributes>> {
        let client = ctx.service("vpc").await?;
        let body = client
            .get(&client.build_path("v1/{project_id}/vpcs/{id}", &[("id", id)]))
            .await?;
        let mut state = flatten(&body);

        let tag_client = ctx.service("networkv2").await?;
        if let Some(tags) = fetch_tags(&tag_client, &tags_path(id)).await {
            state.insert("tags".to_string(), tags_to_value(&tags));
        }
        Ok(Some(state))
    }

    async fn update(
        &self,
        ctx: &ResourceContext<'_>,
        id: &str,
        from: &Attributes,
        to: &Attributes,
        changed: &[String],
    ) -> HandlerResult<()> {
        if has_change(changed, &["name", "cidr", "description"]) {
            let client = ctx.service("vpc").await?;
            let body = json!({
                "vpc": {
                    "name": get_string(to, "name"),
                    "cidr": get_string(to, "cidr"),
                    "description": get_string(to, "description"),
                }
            });
            client
                .put(&client.build_path("v1/{project_id}/vpcs/{id}", &[("id", id)]), body)
                .await?;
        }
        if has_change(changed, &["tags"]) {
            let tag_client = ctx.service("networkv2").await?;
            update_resource_tags(&tag_client, &tags_path(id), &get_tags(from), &get_tags(to)).await?;
        }
        Ok(())
    }

    async fn delete(&self, ctx: &ResourceContext<'_>, id: &str, _attrs: &Attributes) -> HandlerResult<()> {
        let client = ctx.service("vpc").await?;
        let url = client.build_path("v1/{project_id}/vpcs/{id}", &[("id", id)]);
        client.delete(&url).await?;

        let conf = ctx.wait(
            WaitConf::new(&["OK"], &["DELETED"], Duration::from_secs(600))
                .delay(Duration::from_secs(5))
                .poll_interval(Duration::from_secs(3)),
        );
        let (client_ref, url_ref) = (&client, &url);
        wait_for_state(&conf, || async move {
            match client_ref.get(url_ref).await {
                Ok(body) => Ok((body, "OK".to_string())),
                Err(e) if e.is_not_found() => Ok((Json::Null, "DELETED".to_string())),
                Err(e) => Err(e),
            }
        })
        .await?;
        Ok(())
    }
}
