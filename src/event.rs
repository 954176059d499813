use std::time::{SystemTime, UNIX_EPOCH};

use serde::Deserialize;

/// A decoded per-connection traffic delta reported by a proxy backend.
///
/// Collectors produce one of these for every connection update they observe.
/// Byte counts are deltas since the previous report for the same connection.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficEvent {
    /// Requested host name, empty for IP-only connections.
    #[serde(default)]
    pub domain: String,
    /// Destination IP address.
    pub ip: String,
    /// Immediate outbound hop (the proxy node that carried the connection).
    #[serde(default)]
    pub chain: String,
    /// Full ordered hop path, outermost group first.
    #[serde(default)]
    pub chains: Vec<String>,
    /// Name of the matched routing rule.
    #[serde(default)]
    pub rule: String,
    /// Payload of the matched routing rule.
    #[serde(default)]
    pub rule_payload: String,
    /// Upload byte delta.
    #[serde(default)]
    pub upload: f64,
    /// Download byte delta.
    #[serde(default)]
    pub download: f64,
    /// IP of the LAN device that opened the connection, if known.
    #[serde(default)]
    pub source_ip: Option<String>,
    /// Event time in epoch milliseconds. Ingest time is used when absent.
    #[serde(default)]
    pub timestamp_ms: Option<i64>,
}

/// Resolved geographic location of a destination IP.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoLocation {
    /// ISO 3166-1 alpha-2 country code.
    pub country: String,
    pub country_name: String,
    pub continent: String,
}

/// A traffic delta attributed to a destination whose geo lookup has completed.
///
/// `geo` is `None` when the lookup failed or no database was available; such
/// events are accepted but never persisted.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoAttributedEvent {
    pub ip: String,
    #[serde(default)]
    pub geo: Option<GeoLocation>,
    #[serde(default)]
    pub upload: f64,
    #[serde(default)]
    pub download: f64,
    #[serde(default)]
    pub timestamp_ms: Option<i64>,
}

/// Converts a raw byte delta into a non-negative integer.
///
/// Upstream deltas occasionally arrive negative (counter resets) or fractional
/// (rate-derived estimates); both are normalized rather than rejected.
pub fn clamp_bytes(value: f64) -> u64 {
    if !value.is_finite() || value <= 0.0 {
        return 0;
    }
    let floored = value.floor();
    if floored >= u64::MAX as f64 {
        u64::MAX
    } else {
        floored as u64
    }
}

/// Returns the current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_bytes() {
        assert_eq!(clamp_bytes(10.0), 10);
        assert_eq!(clamp_bytes(10.9), 10);
        assert_eq!(clamp_bytes(-5.0), 0);
        assert_eq!(clamp_bytes(0.0), 0);
        assert_eq!(clamp_bytes(f64::NAN), 0);
        assert_eq!(clamp_bytes(f64::INFINITY), 0);
        assert_eq!(clamp_bytes(f64::MAX), u64::MAX);
    }

    #[test]
    fn test_traffic_event_deserializes_collector_payload() {
        let json = r#"{
            "domain": "a.com",
            "ip": "1.1.1.1",
            "chain": "P",
            "chains": ["Proxy", "P"],
            "rule": "MATCH",
            "rulePayload": "",
            "upload": 10,
            "download": 20.5,
            "sourceIp": "192.168.1.2",
            "timestampMs": 1700000000000
        }"#;

        let event: TrafficEvent = serde_json::from_str(json).expect("valid payload");
        assert_eq!(event.domain, "a.com");
        assert_eq!(event.chains, vec!["Proxy".to_string(), "P".to_string()]);
        assert_eq!(event.source_ip.as_deref(), Some("192.168.1.2"));
        assert_eq!(event.timestamp_ms, Some(1_700_000_000_000));
        assert_eq!(clamp_bytes(event.download), 20);
    }

    #[test]
    fn test_geo_event_without_geo() {
        let event: GeoAttributedEvent =
            serde_json::from_str(r#"{"ip": "8.8.8.8", "upload": 1}"#).expect("valid payload");
        assert!(event.geo.is_none());
        assert_eq!(event.download, 0.0);
    }
}
