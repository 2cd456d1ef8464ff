//! Schema - Define type schemas for resources
//!
//! Providers define schemas for each resource type. The engine validates
//! declared attributes against them before any API call is made, and the
//! differ consults them to decide between in-place updates and replacement.

use std::collections::HashMap;
use std::fmt;

use crate::resource::Value;

/// Attribute type
#[derive(Debug, Clone)]
pub enum AttributeType {
    /// String
    String,
    /// Integer
    Int,
    /// Boolean
    Bool,
    /// Enum (list of allowed values)
    Enum(Vec<String>),
    /// Custom type (with validation function)
    Custom {
        name: String,
        base: Box<AttributeType>,
        validate: fn(&Value) -> Result<(), String>,
    },
    /// List
    List(Box<AttributeType>),
    /// Unordered collection; compared without regard to order
    Set(Box<AttributeType>),
    /// Map
    Map(Box<AttributeType>),
    /// Nested block: a map of scalar fields of mixed types
    Block,
}

impl AttributeType {
    /// Check if a value conforms to this type
    pub fn validate(&self, value: &Value) -> Result<(), TypeError> {
        match (self, value) {
            // References are resolved before the provider sees them; accept them anywhere
            (_, Value::ResourceRef(_, _)) => Ok(()),
            (AttributeType::String, Value::String(_)) => Ok(()),
            (AttributeType::Int, Value::Int(_)) => Ok(()),
            (AttributeType::Bool, Value::Bool(_)) => Ok(()),

            (AttributeType::Enum(variants), Value::String(s)) => {
                if variants.iter().any(|v| v == s) {
                    Ok(())
                } else {
                    Err(TypeError::InvalidEnumVariant {
                        value: s.clone(),
                        expected: variants.clone(),
                    })
                }
            }

            (AttributeType::Custom { validate, base, .. }, v) => {
                base.validate(v)?;
                validate(v).map_err(|msg| TypeError::ValidationFailed { message: msg })
            }

            (AttributeType::List(inner) | AttributeType::Set(inner), Value::List(items)) => {
                for (i, item) in items.iter().enumerate() {
                    inner.validate(item).map_err(|e| TypeError::ListItemError {
                        index: i,
                        inner: Box::new(e),
                    })?;
                }
                Ok(())
            }

            (AttributeType::Map(inner), Value::Map(map)) => {
                for (k, v) in map {
                    inner.validate(v).map_err(|e| TypeError::MapValueError {
                        key: k.clone(),
                        inner: Box::new(e),
                    })?;
                }
                Ok(())
            }

            (AttributeType::Block, Value::Map(map)) => {
                for (k, v) in map {
                    if matches!(v, Value::Map(_)) {
                        return Err(TypeError::MapValueError {
                            key: k.clone(),
                            inner: Box::new(TypeError::TypeMismatch {
                                expected: "scalar or list".to_string(),
                                got: v.type_name(),
                            }),
                        });
                    }
                }
                Ok(())
            }

            _ => Err(TypeError::TypeMismatch {
                expected: self.type_name(),
                got: value.type_name(),
            }),
        }
    }

    fn type_name(&self) -> String {
        match self {
            AttributeType::String => "String".to_string(),
            AttributeType::Int => "Int".to_string(),
            AttributeType::Bool => "Bool".to_string(),
            AttributeType::Enum(variants) => format!("Enum({})", variants.join(" | ")),
            AttributeType::Custom { name, .. } => name.clone(),
            AttributeType::List(inner) => format!("List<{}>", inner.type_name()),
            AttributeType::Set(inner) => format!("Set<{}>", inner.type_name()),
            AttributeType::Map(inner) => format!("Map<{}>", inner.type_name()),
            AttributeType::Block => "Block".to_string(),
        }
    }
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.type_name())
    }
}

/// Type error
#[derive(Debug, Clone, thiserror::Error)]
pub enum TypeError {
    #[error("Type mismatch: expected {expected}, got {got}")]
    TypeMismatch { expected: String, got: String },

    #[error("Invalid enum variant '{value}', expected one of: {}", expected.join(", "))]
    InvalidEnumVariant {
        value: String,
        expected: Vec<String>,
    },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },

    #[error("Required attribute '{name}' is missing")]
    MissingRequired { name: String },

    #[error("Attribute '{name}' is computed and cannot be set")]
    ComputedAttributeSet { name: String },

    #[error("Attribute '{name}': {inner}")]
    AttributeError { name: String, inner: Box<TypeError> },

    #[error("List item at index {index}: {inner}")]
    ListItemError { index: usize, inner: Box<TypeError> },

    #[error("Map value for key '{key}': {inner}")]
    MapValueError { key: String, inner: Box<TypeError> },
}

impl Value {
    fn type_name(&self) -> String {
        match self {
            Value::String(_) => "String".to_string(),
            Value::Int(_) => "Int".to_string(),
            Value::Bool(_) => "Bool".to_string(),
            Value::List(_) => "List".to_string(),
            Value::Map(_) => "Map".to_string(),
            Value::ResourceRef(binding, attr) => format!("ResourceRef({}.{})", binding, attr),
        }
    }
}

/// Attribute schema
#[derive(Debug, Clone)]
pub struct AttributeSchema {
    pub name: String,
    pub attr_type: AttributeType,
    pub required: bool,
    /// May be set in configuration (false for computed-only attributes)
    pub optional: bool,
    /// Filled in by the cloud when not configured
    pub computed: bool,
    /// Changing this attribute replaces the resource
    pub force_new: bool,
    /// Never echoed back by the API (passwords, keys)
    pub sensitive: bool,
    pub default: Option<Value>,
    pub description: Option<String>,
    /// Field name in the HuaweiCloud request/response body (e.g., "vip_subnet_cidr_id")
    pub provider_name: Option<String>,
}

impl AttributeSchema {
    pub fn new(name: impl Into<String>, attr_type: AttributeType) -> Self {
        Self {
            name: name.into(),
            attr_type,
            required: false,
            optional: true,
            computed: false,
            force_new: false,
            sensitive: false,
            default: None,
            description: None,
            provider_name: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self.optional = false;
        self
    }

    /// Read-only attribute reported by the API
    pub fn computed(mut self) -> Self {
        self.computed = true;
        self.optional = false;
        self.required = false;
        self
    }

    /// Optional attribute the API fills in when omitted
    pub fn optional_computed(mut self) -> Self {
        self.computed = true;
        self.optional = true;
        self
    }

    pub fn force_new(mut self) -> Self {
        self.force_new = true;
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    pub fn with_provider_name(mut self, name: impl Into<String>) -> Self {
        self.provider_name = Some(name.into());
        self
    }

    /// Name of the field in API payloads
    pub fn api_name(&self) -> &str {
        self.provider_name.as_deref().unwrap_or(&self.name)
    }

    fn settable(&self) -> bool {
        self.required || self.optional
    }
}

/// Resource schema
#[derive(Debug, Clone)]
pub struct ResourceSchema {
    pub resource_type: String,
    pub attributes: HashMap<String, AttributeSchema>,
    pub description: Option<String>,
}

impl ResourceSchema {
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            attributes: HashMap::new(),
            description: None,
        }
    }

    pub fn attribute(mut self, schema: AttributeSchema) -> Self {
        self.attributes.insert(schema.name.clone(), schema);
        self
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&AttributeSchema> {
        self.attributes.get(name)
    }

    /// True if changing `name` requires replacing the resource
    pub fn is_force_new(&self, name: &str) -> bool {
        self.attributes.get(name).is_some_and(|a| a.force_new)
    }

    /// Fill in declared defaults for attributes missing from `attributes`
    pub fn apply_defaults(&self, attributes: &mut HashMap<String, Value>) {
        for (name, schema) in &self.attributes {
            if let Some(default) = &schema.default {
                attributes
                    .entry(name.clone())
                    .or_insert_with(|| default.clone());
            }
        }
    }

    /// Compare two values of attribute `name`, ignoring order for sets
    pub fn values_equal(&self, name: &str, a: &Value, b: &Value) -> bool {
        match (self.attributes.get(name).map(|s| &s.attr_type), a, b) {
            (Some(AttributeType::Set(_)), Value::List(xs), Value::List(ys)) => {
                unordered_eq(xs, ys)
            }
            _ => a == b,
        }
    }

    /// Validate resource attributes
    pub fn validate(&self, attributes: &HashMap<String, Value>) -> Result<(), Vec<TypeError>> {
        let mut errors = Vec::new();

        // Check required attributes
        let mut names: Vec<_> = self.attributes.keys().collect();
        names.sort();
        for name in names {
            let schema = &self.attributes[name];
            if schema.required && !attributes.contains_key(name) && schema.default.is_none() {
                errors.push(TypeError::MissingRequired { name: name.clone() });
            }
        }

        // Type check each attribute
        for (name, value) in attributes {
            let Some(schema) = self.attributes.get(name) else {
                // Unknown attributes are allowed (for flexibility)
                continue;
            };
            if !schema.settable() {
                errors.push(TypeError::ComputedAttributeSet { name: name.clone() });
                continue;
            }
            if let Err(e) = schema.attr_type.validate(value) {
                errors.push(TypeError::AttributeError {
                    name: name.clone(),
                    inner: Box::new(e),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn unordered_eq(xs: &[Value], ys: &[Value]) -> bool {
    if xs.len() != ys.len() {
        return false;
    }
    let mut used = vec![false; ys.len()];
    xs.iter().all(|x| {
        match ys
            .iter()
            .enumerate()
            .position(|(i, y)| !used[i] && x == y)
        {
            Some(i) => {
                used[i] = true;
                true
            }
            None => false,
        }
    })
}

/// Helper functions for common types
pub mod types {
    use super::*;

    /// Positive integer type
    pub fn positive_int() -> AttributeType {
        AttributeType::Custom {
            name: "PositiveInt".to_string(),
            base: Box::new(AttributeType::Int),
            validate: |value| {
                if let Value::Int(n) = value {
                    if *n > 0 {
                        Ok(())
                    } else {
                        Err("Value must be positive".to_string())
                    }
                } else {
                    Err("Expected integer".to_string())
                }
            },
        }
    }

    /// CIDR block type (e.g., "10.0.0.0/16")
    pub fn cidr() -> AttributeType {
        AttributeType::Custom {
            name: "Cidr".to_string(),
            base: Box::new(AttributeType::String),
            validate: |value| {
                if let Value::String(s) = value {
                    validate_cidr(s)
                } else {
                    Err("Expected string".to_string())
                }
            },
        }
    }

    /// IPv4 address type (e.g., "192.168.0.1")
    pub fn ipv4_address() -> AttributeType {
        AttributeType::Custom {
            name: "Ipv4Address".to_string(),
            base: Box::new(AttributeType::String),
            validate: |value| {
                if let Value::String(s) = value {
                    validate_ipv4(s)
                } else {
                    Err("Expected string".to_string())
                }
            },
        }
    }

    /// Resource name: 1-64 letters, digits, `_`, `-` or `.`
    pub fn resource_name() -> AttributeType {
        AttributeType::Custom {
            name: "ResourceName".to_string(),
            base: Box::new(AttributeType::String),
            validate: |value| {
                if let Value::String(s) = value {
                    validate_resource_name(s)
                } else {
                    Err("Expected string".to_string())
                }
            },
        }
    }
}

/// Names accept letters (including non-ASCII), digits, `_`, `-` and `.`
pub fn validate_resource_name(name: &str) -> Result<(), String> {
    let len = name.chars().count();
    if len == 0 || len > 64 {
        return Err(format!("Invalid name '{}': length must be 1-64", name));
    }
    match name
        .chars()
        .find(|c| !(c.is_alphanumeric() || matches!(c, '_' | '-' | '.')))
    {
        Some(c) => Err(format!("Invalid character '{}' in name '{}'", c, name)),
        None => Ok(()),
    }
}

/// Validate dotted-quad IPv4 address format
pub fn validate_ipv4(ip: &str) -> Result<(), String> {
    let octets: Vec<&str> = ip.split('.').collect();
    if octets.len() != 4 {
        return Err(format!("Invalid IP address '{}': expected 4 octets", ip));
    }

    for octet in &octets {
        if octet.parse::<u8>().is_err() {
            return Err(format!(
                "Invalid octet '{}' in IP address: must be 0-255",
                octet
            ));
        }
    }
    Ok(())
}

/// Validate CIDR block format (e.g., "10.0.0.0/16")
pub fn validate_cidr(cidr: &str) -> Result<(), String> {
    let Some((ip, prefix)) = cidr.split_once('/') else {
        return Err(format!(
            "Invalid CIDR format '{}': expected IP/prefix",
            cidr
        ));
    };

    validate_ipv4(ip)?;

    // Validate prefix length
    match prefix.parse::<u8>() {
        Ok(p) if p <= 32 => Ok(()),
        Ok(p) => Err(format!("Invalid prefix length '{}': must be 0-32", p)),
        Err(_) => Err(format!(
            "Invalid prefix length '{}': must be a number",
            prefix
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_string_type() {
        let t = AttributeType::String;
        assert!(t.validate(&Value::String("hello".to_string())).is_ok());
        assert!(t.validate(&Value::Int(42)).is_err());
    }

    #[test]
    fn validate_enum_type() {
        let t = AttributeType::Enum(vec!["postPaid".to_string(), "prePaid".to_string()]);
        assert!(t.validate(&Value::string("prePaid")).is_ok());
        assert!(t.validate(&Value::string("monthly")).is_err());
    }

    #[test]
    fn validate_positive_int() {
        let t = types::positive_int();
        assert!(t.validate(&Value::Int(1)).is_ok());
        assert!(t.validate(&Value::Int(100)).is_ok());
        assert!(t.validate(&Value::Int(0)).is_err());
        assert!(t.validate(&Value::Int(-1)).is_err());
        assert!(t.validate(&Value::string("1")).is_err());
    }

    #[test]
    fn blocks_take_mixed_scalars() {
        let block: HashMap<String, Value> = [
            ("protocol".to_string(), Value::string("TCP")),
            ("service_port".to_string(), Value::Int(8080)),
        ]
        .into();
        assert!(AttributeType::Block.validate(&Value::Map(block)).is_ok());

        let nested: HashMap<String, Value> =
            [("inner".to_string(), Value::Map(HashMap::new()))].into();
        assert!(AttributeType::Block.validate(&Value::Map(nested)).is_err());
        assert!(AttributeType::Block.validate(&Value::Int(1)).is_err());
    }

    #[test]
    fn references_pass_any_type() {
        let r = Value::ResourceRef("vpc".into(), "id".into());
        assert!(AttributeType::Int.validate(&r).is_ok());
        assert!(types::cidr().validate(&r).is_ok());
    }

    #[test]
    fn validate_resource_schema() {
        let schema = ResourceSchema::new("vpc")
            .attribute(AttributeSchema::new("name", AttributeType::String).required())
            .attribute(AttributeSchema::new("size", types::positive_int()))
            .attribute(AttributeSchema::new("enabled", AttributeType::Bool));

        let mut attrs = HashMap::new();
        attrs.insert("name".to_string(), Value::String("my-vpc".to_string()));
        attrs.insert("size".to_string(), Value::Int(5));
        attrs.insert("enabled".to_string(), Value::Bool(true));

        assert!(schema.validate(&attrs).is_ok());
    }

    #[test]
    fn missing_required_attribute() {
        let schema = ResourceSchema::new("vpc")
            .attribute(AttributeSchema::new("name", AttributeType::String).required());

        let attrs = HashMap::new();
        let errors = schema.validate(&attrs).unwrap_err();
        assert!(matches!(&errors[0], TypeError::MissingRequired { name } if name == "name"));
    }

    #[test]
    fn computed_attribute_cannot_be_set() {
        let schema = ResourceSchema::new("vpc")
            .attribute(AttributeSchema::new("status", AttributeType::String).computed())
            .attribute(AttributeSchema::new("description", AttributeType::String).optional_computed());

        let mut attrs = HashMap::new();
        attrs.insert("description".to_string(), Value::string("ok"));
        assert!(schema.validate(&attrs).is_ok());

        attrs.insert("status".to_string(), Value::string("OK"));
        let errors = schema.validate(&attrs).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(matches!(&errors[0], TypeError::ComputedAttributeSet { name } if name == "status"));
    }

    #[test]
    fn type_errors_name_the_attribute() {
        let schema = ResourceSchema::new("vpc_subnet")
            .attribute(AttributeSchema::new("cidr", types::cidr()));
        let mut attrs = HashMap::new();
        attrs.insert("cidr".to_string(), Value::string("10.0.0.0/40"));
        let errors = schema.validate(&attrs).unwrap_err();
        assert!(errors[0].to_string().starts_with("Attribute 'cidr'"));
    }

    #[test]
    fn set_values_compare_without_order() {
        let schema = ResourceSchema::new("elb_loadbalancer").attribute(AttributeSchema::new(
            "availability_zone",
            AttributeType::Set(Box::new(AttributeType::String)),
        ));
        let a = Value::List(vec![Value::string("az1"), Value::string("az2")]);
        let b = Value::List(vec![Value::string("az2"), Value::string("az1")]);
        let c = Value::List(vec![Value::string("az2"), Value::string("az2")]);
        assert!(schema.values_equal("availability_zone", &a, &b));
        assert!(!schema.values_equal("availability_zone", &a, &c));
        // Lists keep their order
        assert!(!ResourceSchema::new("x").values_equal("availability_zone", &a, &b));
    }

    #[test]
    fn apply_defaults_keeps_configured_values() {
        let schema = ResourceSchema::new("vpc_subnet")
            .attribute(
                AttributeSchema::new("dhcp_enable", AttributeType::Bool)
                    .with_default(Value::Bool(true)),
            )
            .attribute(
                AttributeSchema::new("ipv6_enable", AttributeType::Bool)
                    .with_default(Value::Bool(false)),
            );
        let mut attrs = HashMap::new();
        attrs.insert("ipv6_enable".to_string(), Value::Bool(true));
        schema.apply_defaults(&mut attrs);
        assert_eq!(attrs["dhcp_enable"], Value::Bool(true));
        assert_eq!(attrs["ipv6_enable"], Value::Bool(true));
    }

    #[test]
    fn validate_cidr_type() {
        let t = types::cidr();

        // Valid CIDRs
        assert!(t.validate(&Value::string("10.0.0.0/16")).is_ok());
        assert!(t.validate(&Value::string("192.168.1.0/24")).is_ok());
        assert!(t.validate(&Value::string("0.0.0.0/0")).is_ok());
        assert!(t.validate(&Value::string("255.255.255.255/32")).is_ok());

        // Invalid CIDRs
        assert!(t.validate(&Value::string("10.0.0.0")).is_err()); // no prefix
        assert!(t.validate(&Value::string("10.0.0.0/33")).is_err()); // prefix too large
        assert!(t.validate(&Value::string("10.0.0.256/16")).is_err()); // octet > 255
        assert!(t.validate(&Value::string("10.0.0/16")).is_err()); // only 3 octets
        assert!(t.validate(&Value::string("invalid")).is_err());
        assert!(t.validate(&Value::Int(42)).is_err()); // wrong type
    }

    #[test]
    fn validate_ipv4_type() {
        let t = types::ipv4_address();
        assert!(t.validate(&Value::string("192.168.0.1")).is_ok());
        assert!(t.validate(&Value::string("192.168.0")).is_err());
        assert!(t.validate(&Value::string("192.168.0.300")).is_err());
    }

    #[test]
    fn validate_resource_name_type() {
        let t = types::resource_name();
        assert!(t.validate(&Value::string("subnet-web_01.a")).is_ok());
        assert!(t.validate(&Value::string("子网-1")).is_ok());
        assert!(t.validate(&Value::string("")).is_err());
        assert!(t.validate(&Value::string("bad name")).is_err());
        assert!(t.validate(&Value::string(&"x".repeat(65))).is_err());
    }
}
