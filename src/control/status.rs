//! Parsing of `GETINFO` values the control library hands back as raw text.

use stem_rs::descriptor::router_status::{RouterStatusEntry, RouterStatusEntryType};
use thiserror::Error;

use super::event::{Circuit, CircuitStatus, Hop};

/// Errors raised while interpreting a `GETINFO` value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("reading {key}: missing {field}")]
    MissingField {
        key: &'static str,
        field: &'static str,
    },

    #[error("router status entry has no r line")]
    MissingRouterLine,

    #[error("invalid relay address {raw:?}")]
    InvalidAddress { raw: String },

    #[error("invalid counter value {raw:?}")]
    InvalidCounter { raw: String },
}

/// Parse the value of `GETINFO circuit-status`, one circuit per line.
pub fn parse_circuit_status(value: &str) -> Result<Vec<Circuit>, ParseError> {
    value
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(parse_circuit_line)
        .collect()
}

/// Parse the value of `GETINFO ns/id/<fingerprint>` into a router status
/// entry for `fingerprint`.
pub fn parse_router_status(fingerprint: &str, value: &str) -> Result<RouterStatusEntry, ParseError> {
    let mut entry = None;

    for line in value.lines() {
        if let Some(rest) = line.strip_prefix("r ") {
            // nickname identity digest date time address orport dirport
            let parts: Vec<&str> = rest.split_whitespace().collect();
            let nickname = parts.first().ok_or(ParseError::MissingField {
                key: "ns/id",
                field: "nickname",
            })?;
            let raw_address = parts.get(5).ok_or(ParseError::MissingField {
                key: "ns/id",
                field: "address",
            })?;
            let address = raw_address.parse().map_err(|_| ParseError::InvalidAddress {
                raw: raw_address.to_string(),
            })?;
            let or_port = parts.get(6).and_then(|p| p.parse().ok()).unwrap_or(0);

            entry = Some(RouterStatusEntry::new(
                RouterStatusEntryType::V3,
                nickname.to_string(),
                fingerprint.to_string(),
                chrono::Utc::now(),
                address,
                or_port,
            ));
        } else if let Some(rest) = line.strip_prefix("s ") {
            if let Some(ref mut router) = entry {
                router.flags = rest.split_whitespace().map(str::to_string).collect();
            }
        } else if let Some(rest) = line.strip_prefix("w ") {
            if let Some(ref mut router) = entry {
                for part in rest.split_whitespace() {
                    match part.split_once('=') {
                        Some(("Bandwidth", v)) => router.bandwidth = v.parse().ok(),
                        Some(("Measured", v)) => router.measured = v.parse().ok(),
                        _ => {}
                    }
                }
            }
        }
    }

    entry.ok_or(ParseError::MissingRouterLine)
}

/// Parse a cumulative counter such as `traffic/read`.
pub fn parse_counter(raw: &str) -> Result<u64, ParseError> {
    raw.trim()
        .parse::<u64>()
        .map_err(|_| ParseError::InvalidCounter {
            raw: raw.to_string(),
        })
}

/// Normalize an `ip-to-country` answer; `??` means the relay has no mapping.
pub fn parse_country(raw: &str) -> Option<String> {
    let code = raw.trim();
    if code.is_empty() || code == "??" {
        None
    } else {
        Some(code.to_string())
    }
}

/// Address portion of an `address:port` stream target.
pub fn target_address(target: &str) -> &str {
    if let Some(rest) = target.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }

    match target.rsplit_once(':') {
        Some((host, port))
            if !host.contains(':') && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            host
        }
        _ => target,
    }
}

fn parse_circuit_line(line: &str) -> Result<Circuit, ParseError> {
    let mut tokens = line.split_whitespace();

    let id = tokens.next().ok_or(ParseError::MissingField {
        key: "circuit-status",
        field: "circuit id",
    })?;
    let status = tokens.next().ok_or(ParseError::MissingField {
        key: "circuit-status",
        field: "status",
    })?;

    // Keyword arguments (`PURPOSE=GENERAL`) follow the path, which may be absent.
    let path = match tokens.next() {
        Some(token) if token.starts_with('$') || !token.contains('=') => token
            .split(',')
            .filter(|name| !name.is_empty())
            .map(Hop::from_long_name)
            .collect(),
        _ => Vec::new(),
    };

    Ok(Circuit {
        id: id.to_string(),
        status: CircuitStatus::parse(status),
        path,
    })
}
