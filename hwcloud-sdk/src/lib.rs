//! HuaweiCloud SDK
//!
//! HTTP layer shared by every resource of the provider.
//!
//! ## Module Structure
//!
//! - `config` - Credentials, region and endpoint settings
//! - `catalog` - Service catalog (host names, versions, scopes)
//! - `signer` - AK/SK request signing
//! - `client` - `ProviderClient` and per-service `ServiceClient`
//! - `identity` - Project and domain ID lookups, password tokens
//! - `pagination` - Marker, offset and page-number list walking
//! - `waiter` - State polling and async job waits
//! - `bss` - Billing order waits and unsubscription
//! - `tags` - Tag request bodies and batch updates
//! - `json` - Path lookups and body cleanup

pub mod bss;
pub mod catalog;
pub mod client;
pub mod config;
pub mod error;
pub mod identity;
pub mod json;
pub mod pagination;
pub mod signer;
pub mod tags;
pub mod waiter;

pub use reqwest::Method;

pub use client::{ProviderClient, RequestOpts, Response, ServiceClient, with_query};
pub use config::{AuthMode, Config};
pub use error::{SdkError, SdkResult};
pub use pagination::{ListOpts, PageStrategy, list_all_items};
pub use waiter::{WaitConf, wait_for_job, wait_for_state};
