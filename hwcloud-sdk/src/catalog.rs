//! Service catalog: where each HuaweiCloud service lives.

/// Static description of a service endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceCatalog {
    /// Host prefix, e.g. `vpc` in `vpc.cn-north-4.myhuaweicloud.com`
    pub name: &'static str,
    pub version: &'static str,
    /// Served from a single global endpoint rather than per region
    pub scope_global: bool,
    /// Request paths do not contain the project ID
    pub without_project_id: bool,
    pub resource_base: &'static str,
    /// Domain-level (account-level) API
    pub admin: bool,
}

const fn regional(name: &'static str, version: &'static str) -> ServiceCatalog {
    ServiceCatalog {
        name,
        version,
        scope_global: false,
        without_project_id: false,
        resource_base: "",
        admin: false,
    }
}

const fn global(name: &'static str, version: &'static str) -> ServiceCatalog {
    ServiceCatalog {
        name,
        version,
        scope_global: true,
        without_project_id: true,
        resource_base: "",
        admin: true,
    }
}

static CATALOG: &[(&str, ServiceCatalog)] = &[
    ("iam", global("iam", "v3")),
    ("identity", global("iam", "v3")),
    ("eps", global("eps", "v1.0")),
    (
        "bss",
        ServiceCatalog {
            admin: false,
            ..global("bss", "v2")
        },
    ),
    (
        "bssv2",
        ServiceCatalog {
            admin: false,
            ..global("bss", "v2")
        },
    ),
    ("ecs", regional("ecs", "v1")),
    ("ecsv11", regional("ecs", "v1.1")),
    ("evs", regional("evs", "v2")),
    ("evsv21", regional("evs", "v2.1")),
    ("vpc", regional("vpc", "v1")),
    ("networkv2", regional("vpc", "v2.0")),
    (
        "vpcv3",
        ServiceCatalog {
            resource_base: "vpc",
            ..regional("vpc", "v3")
        },
    ),
    ("security_group", regional("vpc", "v1")),
    (
        "elb",
        ServiceCatalog {
            resource_base: "elb",
            ..regional("elb", "v3")
        },
    ),
    ("elbv2", regional("elb", "v2")),
    ("vpcep", regional("vpcep", "v1")),
    ("nat", regional("nat", "v2")),
    (
        "dns",
        ServiceCatalog {
            without_project_id: true,
            scope_global: true,
            ..regional("dns", "v2")
        },
    ),
];

pub fn lookup(key: &str) -> Option<&'static ServiceCatalog> {
    CATALOG.iter().find(|(k, _)| *k == key).map(|(_, c)| c)
}

/// Catalog keys served by the same endpoint as `key`; a custom endpoint for
/// `key` also applies to them unless they are configured explicitly.
pub fn derived_catalog_keys(key: &str) -> &'static [&'static str] {
    match key {
        "iam" => &["identity"],
        "bss" => &["bssv2"],
        "ecs" => &["ecsv11"],
        "evs" => &["evsv21"],
        "vpc" => &["networkv2", "vpcv3", "security_group"],
        "elb" => &["elbv2"],
        _ => &[],
    }
}

impl ServiceCatalog {
    /// Default endpoint URL (with trailing slash)
    pub fn default_endpoint(&self, region: &str, cloud: &str, region_endpoints: bool) -> String {
        if self.scope_global && !region_endpoints {
            format!("https://{}.{}/", self.name, cloud)
        } else {
            format!("https://{}.{}.{}/", self.name, region, cloud)
        }
    }

    /// `{endpoint}{version}/{project_id}/{resource_base}/`
    pub fn resource_base_url(&self, endpoint: &str, project_id: &str) -> String {
        let mut url = format!("{}{}/", endpoint, self.version);
        if !self.without_project_id && !project_id.is_empty() {
            url.push_str(project_id);
            url.push('/');
        }
        if !self.resource_base.is_empty() {
            url.push_str(self.resource_base);
            url.push('/');
        }
        url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regional_and_global_endpoints() {
        let vpc = lookup("vpc").unwrap();
        assert_eq!(
            vpc.default_endpoint("cn-north-4", "myhuaweicloud.com", false),
            "https://vpc.cn-north-4.myhuaweicloud.com/"
        );

        let bss = lookup("bss").unwrap();
        assert_eq!(
            bss.default_endpoint("cn-north-4", "myhuaweicloud.com", false),
            "https://bss.myhuaweicloud.com/"
        );
        assert_eq!(
            bss.default_endpoint("eu-west-101", "myhuaweicloud.eu", true),
            "https://bss.eu-west-101.myhuaweicloud.eu/"
        );
    }

    #[test]
    fn resource_base_includes_project_unless_global() {
        let elb = lookup("elb").unwrap();
        assert_eq!(
            elb.resource_base_url("https://elb.example/", "p1"),
            "https://elb.example/v3/p1/elb/"
        );
        let iam = lookup("iam").unwrap();
        assert_eq!(
            iam.resource_base_url("https://iam.example/", "p1"),
            "https://iam.example/v3/"
        );
    }

    #[test]
    fn every_derived_key_is_in_the_catalog() {
        for (key, _) in CATALOG {
            for derived in derived_catalog_keys(key) {
                assert!(lookup(derived).is_some(), "{} -> {}", key, derived);
            }
        }
    }
}
