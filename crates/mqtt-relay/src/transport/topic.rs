/*
 * SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
 * SPDX-License-Identifier: LicenseRef-NvidiaProprietary
 *
 * NVIDIA CORPORATION, its affiliates and licensors retain all intellectual
 * property and proprietary rights in and to this material, related
 * documentation and any modifications thereto. Any use, reproduction,
 * disclosure or distribution of this material and related documentation
 * without an express license agreement from NVIDIA CORPORATION or
 * its affiliates is strictly prohibited.
 */

// src/transport/topic.rs
// Broker address parsing and MQTT topic filter matching.

use regex::Regex;

use crate::errors::TransportError;

pub const DEFAULT_PORT: u16 = 1883;
pub const DEFAULT_TLS_PORT: u16 = 8883;

// BrokerAddress is a parsed broker string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl std::fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = if self.tls { "ssl" } else { "tcp" };
        if self.host.contains(':') {
            write!(f, "{scheme}://[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{scheme}://{}:{}", self.host, self.port)
        }
    }
}

// parse_broker accepts `tcp://`, `mqtt://`, `ssl://`, `tls://`, `mqtts://`
// or no scheme at all, followed by `host`, `host:port` or `[v6addr]:port`.
pub fn parse_broker(broker: &str) -> Result<BrokerAddress, TransportError> {
    let invalid = |reason: &str| TransportError::InvalidBroker {
        broker: broker.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = broker.trim();
    let (tls, rest) = match trimmed.split_once("://") {
        Some((scheme, rest)) => match scheme.to_ascii_lowercase().as_str() {
            "tcp" | "mqtt" => (false, rest),
            "ssl" | "tls" | "mqtts" => (true, rest),
            _ => return Err(invalid("unsupported scheme")),
        },
        None => (false, trimmed),
    };
    let rest = rest.trim_end_matches('/');
    let default_port = if tls { DEFAULT_TLS_PORT } else { DEFAULT_PORT };

    let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
        let (host, after) = bracketed
            .split_once(']')
            .ok_or_else(|| invalid("unterminated IPv6 address"))?;
        let port = match after.strip_prefix(':') {
            Some(port) => Some(port),
            None if after.is_empty() => None,
            None => return Err(invalid("unexpected characters after IPv6 address")),
        };
        (host, port)
    } else {
        match rest.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (rest, None),
        }
    };

    if host.is_empty() {
        return Err(invalid("missing host"));
    }
    let port = match port {
        Some(port) => port.parse::<u16>().map_err(|_| invalid("invalid port"))?,
        None => default_port,
    };

    Ok(BrokerAddress {
        host: host.to_string(),
        port,
        tls,
    })
}

// filter_regex compiles an MQTT topic filter into an anchored regex,
// honoring the single-level `+` and multi-level `#` wildcards. A leading
// wildcard never matches topics starting with `$`.
pub fn filter_regex(filter: &str) -> Result<Regex, TransportError> {
    let invalid = |reason: &str| TransportError::InvalidFilter {
        filter: filter.to_string(),
        reason: reason.to_string(),
    };
    if filter.is_empty() {
        return Err(invalid("empty filter"));
    }

    let levels: Vec<&str> = filter.split('/').collect();
    let mut pattern = String::from("^");
    for (i, level) in levels.iter().enumerate() {
        let first = i == 0;
        match *level {
            "#" => {
                if i + 1 != levels.len() {
                    return Err(invalid("'#' must be the last level"));
                }
                pattern.push_str(if first { "(?:[^$].*)?" } else { "(?:/.*)?" });
            }
            "+" => {
                if first {
                    pattern.push_str("(?:[^$/][^/]*)?");
                } else {
                    pattern.push_str("/[^/]*");
                }
            }
            literal => {
                if literal.contains(['+', '#']) {
                    return Err(invalid("wildcards must occupy a whole level"));
                }
                if !first {
                    pattern.push('/');
                }
                pattern.push_str(&regex::escape(literal));
            }
        }
    }
    pattern.push('$');

    Regex::new(&pattern).map_err(|e| invalid(&e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_broker_schemes_and_ports() {
        assert_eq!(
            parse_broker("tcp://broker.local:1884").unwrap(),
            BrokerAddress {
                host: "broker.local".into(),
                port: 1884,
                tls: false
            }
        );
        assert_eq!(parse_broker("mqtt://broker.local").unwrap().port, 1883);
        let tls = parse_broker("ssl://broker.local").unwrap();
        assert!(tls.tls);
        assert_eq!(tls.port, 8883);
        assert_eq!(parse_broker("localhost:1883").unwrap().host, "localhost");
        assert_eq!(parse_broker("[::1]:1999").unwrap().host, "::1");
        assert_eq!(parse_broker("[::1]").unwrap().port, 1883);
    }

    #[test]
    fn test_parse_broker_rejects_garbage() {
        for broker in ["", "ws://host", "tcp://:1883", "host:notaport", "[::1"] {
            let err = parse_broker(broker).unwrap_err();
            assert!(
                matches!(err, TransportError::InvalidBroker { .. }),
                "{broker}: {err}"
            );
        }
    }

    #[test]
    fn test_broker_address_display() {
        assert_eq!(
            parse_broker("localhost").unwrap().to_string(),
            "tcp://localhost:1883"
        );
        assert_eq!(
            parse_broker("mqtts://[::1]:1").unwrap().to_string(),
            "ssl://[::1]:1"
        );
    }

    fn matches(filter: &str, topic: &str) -> bool {
        filter_regex(filter).unwrap().is_match(topic)
    }

    #[test]
    fn test_filter_matching() {
        assert!(matches("myTopic", "myTopic"));
        assert!(!matches("myTopic", "myTopicNew"));
        assert!(matches("sensors/+/temp", "sensors/a/temp"));
        assert!(!matches("sensors/+/temp", "sensors/a/b/temp"));
        assert!(matches("sensors/#", "sensors"));
        assert!(matches("sensors/#", "sensors/a/b"));
        assert!(!matches("sensors/#", "sensorsX"));
        assert!(matches("#", "anything/at/all"));
        assert!(!matches("#", "$SYS/uptime"));
        assert!(!matches("+/uptime", "$SYS/uptime"));
        assert!(matches("$SYS/#", "$SYS/uptime"));
        assert!(!matches("a/b", "a"));
        assert!(matches("a.b", "a.b"));
        assert!(!matches("a.b", "axb"));
    }

    #[test]
    fn test_filter_regex_rejects_misplaced_wildcards() {
        for filter in ["", "a/#/b", "a+/b", "a/b#"] {
            assert!(
                matches!(
                    filter_regex(filter),
                    Err(TransportError::InvalidFilter { .. })
                ),
                "{filter}"
            );
        }
    }
}
