//! IAM lookups: project IDs per region, the account domain ID, and
//! password-based token issuance.

use reqwest::Method;
use serde_json::{Value, json};

use crate::client::{ProviderClient, RequestOpts, with_query};
use crate::config::AuthMode;
use crate::error::{SdkError, SdkResult};
use crate::json::path_search_str;

const HEADER_SUBJECT_TOKEN: &str = "x-subject-token";

impl ProviderClient {
    /// Project ID for `region`, looked up once and cached
    pub async fn project_id(&self, region: &str) -> SdkResult<String> {
        if let Some(id) = self.inner.projects.lock().await.get(region) {
            return Ok(id.clone());
        }

        if matches!(self.inner.auth, AuthMode::Password { .. }) {
            // the scoped token response carries the project
            self.password_token(region).await?;
            return self
                .inner
                .projects
                .lock()
                .await
                .get(region)
                .cloned()
                .ok_or_else(|| no_project(region));
        }

        // Hold the lock across the query so concurrent callers do not repeat it
        let mut projects = self.inner.projects.lock().await;
        if let Some(id) = projects.get(region) {
            return Ok(id.clone());
        }

        let identity = self.identity_client(self.credential(region).await?)?;
        let name = self.inner.config.project_name_for(region);
        let url = with_query(&identity.url("v3/projects"), &[("name", name.clone())]);
        log::debug!("looking up project ID of {}", name);
        let body = identity.get(&url).await?;

        let mut found = None;
        for project in body
            .get("projects")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let (Some(project_name), Some(id)) = (
                project.get("name").and_then(Value::as_str),
                project.get("id").and_then(Value::as_str),
            ) else {
                continue;
            };
            if project_name == name {
                found = Some(id.to_string());
            }
            projects.insert(project_name.to_string(), id.to_string());
        }

        let id = found.ok_or_else(|| no_project(region))?;
        projects.insert(region.to_string(), id.clone());
        Ok(id)
    }

    /// Account (domain) ID, from configuration or `GET v3/auth/domains`
    pub async fn domain_id(&self) -> SdkResult<String> {
        let mut cached = self.inner.domain_id.lock().await;
        if let Some(id) = cached.as_ref() {
            return Ok(id.clone());
        }

        let region = self.inner.config.region.clone();
        let identity = self.identity_client(self.credential(&region).await?)?;
        let body = identity.get(&identity.url("v3/auth/domains")).await?;
        let domain = body
            .get("domains")
            .and_then(Value::as_array)
            .and_then(|d| d.first())
            .ok_or_else(|| SdkError::missing("domains[0]"))?;
        let id = domain
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| SdkError::missing("domains[0].id"))?;

        if let Some(expected) = self.inner.config.domain_name.as_deref() {
            let name = domain.get("name").and_then(Value::as_str).unwrap_or_default();
            if !expected.is_empty() && expected != name {
                return Err(SdkError::Config(format!(
                    "domain_name {} does not match the account domain {}",
                    expected, name
                )));
            }
        }

        *cached = Some(id.to_string());
        Ok(id.to_string())
    }

    /// Token for password auth, issued once via `POST v3/auth/tokens`
    pub(crate) async fn password_token(&self, region: &str) -> SdkResult<String> {
        let mut cached = self.inner.token.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }

        let AuthMode::Password {
            user_name,
            user_id,
            password,
        } = &self.inner.auth
        else {
            return Err(SdkError::Config("password authentication is not configured".into()));
        };

        let config = &self.inner.config;
        let user = match (user_id, user_name) {
            (Some(id), _) => json!({"id": id, "password": password}),
            (None, Some(name)) => {
                let domain = match (&config.domain_id, &config.domain_name) {
                    (Some(id), _) => json!({"id": id}),
                    (None, Some(domain)) => json!({"name": domain}),
                    // the account's own IAM user shares the domain name
                    (None, None) => json!({"name": name}),
                };
                json!({"name": name, "password": password, "domain": domain})
            }
            (None, None) => return Err(SdkError::MissingCredentials),
        };
        let body = json!({
            "auth": {
                "identity": {"methods": ["password"], "password": {"user": user}},
                "scope": {"project": {"name": config.project_name_for(region)}}
            }
        });

        let identity = self.identity_client(None)?;
        let url = identity.url("v3/auth/tokens");
        log::debug!("issuing token for {}", region);
        let response = identity
            .request_raw(Method::POST, &url, RequestOpts::json(body).with_ok_codes(&[201]))
            .await?;
        let token = response
            .header(HEADER_SUBJECT_TOKEN)
            .ok_or_else(|| SdkError::missing("X-Subject-Token"))?
            .to_string();

        let body = response.json(&url)?;
        if let Some(project_id) = path_search_str("token.project.id", &body) {
            self.inner
                .projects
                .lock()
                .await
                .insert(region.to_string(), project_id);
        }

        *cached = Some(token.clone());
        Ok(token)
    }
}

fn no_project(region: &str) -> SdkError {
    SdkError::Config(format!("no project ID found for region {}", region))
}
