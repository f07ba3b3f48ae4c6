//! Coarse location context for the launch event
//!
//! Either an external-IP service (plain text body, reported as `ip`) or a
//! geolocation service (JSON with `city`, `country`, `region`...) is queried
//! once per session. The external-IP service wins when both are configured.
//! Any failure just means the launch goes out without the extra context.

use std::time::Duration;

use serde_json::Value;

use crate::config::AnalyticsConfig;
use crate::error::{Error, Result};
use crate::event::Properties;

/// Alternatives per reported key; the first non-blank value of each group is used
const GEOLOCATION_FIELDS: &[&[&str]] = &[
    &["city"],
    &["country", "countryCode"],
    &["regionName", "region"],
];

/// Which lookup to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocationLookup {
    ExternalIp(String),
    Geolocation(String),
}

impl LocationLookup {
    /// Pick the lookup configured for this session; blank URLs count as unset
    pub fn from_config(config: &AnalyticsConfig) -> Option<Self> {
        let non_blank = |url: &Option<String>| {
            url.as_deref()
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(str::to_string)
        };

        non_blank(&config.external_ip_url)
            .map(LocationLookup::ExternalIp)
            .or_else(|| non_blank(&config.geolocation_url).map(LocationLookup::Geolocation))
    }

    pub fn url(&self) -> &str {
        match self {
            LocationLookup::ExternalIp(url) | LocationLookup::Geolocation(url) => url,
        }
    }

    /// Fetch and interpret the lookup response
    pub async fn fetch(&self, timeout: Duration) -> Result<Properties> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        let response = client
            .get(self.url())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Delivery(format!("location lookup failed: {}", e)))?;

        let body = response
            .text()
            .await
            .map_err(|e| Error::Delivery(format!("location lookup failed: {}", e)))?;

        match self {
            LocationLookup::ExternalIp(_) => external_ip_properties(&body),
            LocationLookup::Geolocation(_) => geolocation_properties(&serde_json::from_str(&body)?),
        }
    }
}

fn external_ip_properties(body: &str) -> Result<Properties> {
    let ip = body.trim();
    if ip.is_empty() {
        return Err(Error::Delivery("external IP service returned nothing".to_string()));
    }
    Ok(Properties::from([("ip".to_string(), ip.to_string())]))
}

/// Extract the reported location keys from a geolocation response
pub fn geolocation_properties(json: &Value) -> Result<Properties> {
    let object = json
        .as_object()
        .ok_or_else(|| Error::Delivery("geolocation response is not an object".to_string()))?;

    let mut properties = Properties::new();
    for group in GEOLOCATION_FIELDS {
        let found = group.iter().find_map(|key| {
            let value = match object.get(*key)? {
                Value::String(s) => s.trim().to_string(),
                Value::Number(n) => n.to_string(),
                _ => return None,
            };
            (!value.is_empty()).then(|| (key.to_string(), value))
        });
        if let Some((key, value)) = found {
            properties.insert(key, value);
        }
    }
    Ok(properties)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_geolocation_groups() {
        let response = json!({
            "status": "success",
            "city": "Dallas",
            "country": "",
            "countryCode": "US",
            "regionName": "Texas",
            "region": "TX",
        });
        let props = geolocation_properties(&response).unwrap();

        assert_eq!(props.get("city").map(String::as_str), Some("Dallas"));
        assert_eq!(props.get("countryCode").map(String::as_str), Some("US"));
        assert!(!props.contains_key("country"));
        assert_eq!(props.get("regionName").map(String::as_str), Some("Texas"));
        assert!(!props.contains_key("region"));
        assert!(!props.contains_key("status"));
    }

    #[test]
    fn test_geolocation_missing_fields() {
        let props = geolocation_properties(&json!({"region": "TX"})).unwrap();
        assert_eq!(props.len(), 1);
        assert_eq!(props["region"], "TX");

        assert!(geolocation_properties(&json!(["not", "an", "object"])).is_err());
    }

    #[test]
    fn test_external_ip_body() {
        let props = external_ip_properties("  203.0.113.7\n").unwrap();
        assert_eq!(props["ip"], "203.0.113.7");
        assert!(external_ip_properties("   ").is_err());
    }

    #[test]
    fn test_lookup_selection() {
        let config = AnalyticsConfig::default();
        assert_eq!(
            LocationLookup::from_config(&config),
            Some(LocationLookup::Geolocation("http://ip-api.com/json/".to_string()))
        );

        let config = AnalyticsConfig {
            external_ip_url: Some("https://ip.example.com".to_string()),
            ..Default::default()
        };
        assert_eq!(
            LocationLookup::from_config(&config),
            Some(LocationLookup::ExternalIp("https://ip.example.com".to_string()))
        );

        let config = AnalyticsConfig {
            geolocation_url: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(LocationLookup::from_config(&config), None);
    }
}
