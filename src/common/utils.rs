//! Utility functions for minigfs

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use if_addrs::get_if_addrs;
use std::net::IpAddr;

/// Percent-encoding set for names used as a single coordination path segment
const NAME_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b'/')
    .add(b'%')
    .add(b' ')
    .add(b'?')
    .add(b'#')
    .add(b'&');

/// Encode a file name for use as one path segment
pub fn encode_name(name: &str) -> String {
    utf8_percent_encode(name, NAME_ENCODE_SET).to_string()
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_idx])
}

/// Parse duration string (e.g., "500ms", "30s", "5m", "1h")
pub fn parse_duration(s: &str) -> crate::Result<std::time::Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(crate::Error::InvalidConfig("empty duration".into()));
    }

    let (num_str, unit) = if let Some(num) = s.strip_suffix("ms") {
        (num, "ms")
    } else {
        s.split_at(s.len() - s.chars().last().map_or(0, char::len_utf8))
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| crate::Error::InvalidConfig(format!("invalid duration: {}", s)))?;

    let duration = match unit {
        "ms" => std::time::Duration::from_millis(num),
        "s" => std::time::Duration::from_secs(num),
        "m" => std::time::Duration::from_secs(num * 60),
        "h" => std::time::Duration::from_secs(num * 3600),
        _ => {
            return Err(crate::Error::InvalidConfig(format!(
                "unknown duration unit: {}",
                unit
            )))
        }
    };

    Ok(duration)
}

/// Reduce an advertised address to the host a remote shell can target.
///
/// `user@tcp://10.0.0.7:4400` becomes `user@10.0.0.7`, `tcp://host:4400`
/// becomes `host`.
pub fn normalize_address(address: &str) -> String {
    let address = address.trim();
    let (user, rest) = match address.split_once('@') {
        Some((user, rest)) => (Some(user), rest),
        None => (None, address),
    };
    let rest = rest.split_once("://").map_or(rest, |(_, r)| r);
    let host = match rest.rfind(':') {
        Some(idx) => &rest[..idx],
        None => rest,
    };

    match user {
        Some(user) => format!("{}@{}", user, host),
        None => host.to_string(),
    }
}

/// Turn an advertised `tcp://host:port` (optionally `user@` prefixed) into an
/// HTTP base URL.
pub fn http_base_url(address: &str) -> String {
    let address = address.trim();
    let address = address.rsplit_once('@').map_or(address, |(_, a)| a);
    let address = address.trim_end_matches('/');
    match address.split_once("://") {
        Some(("tcp", rest)) => format!("http://{}", rest),
        Some(_) => address.to_string(),
        None => format!("http://{}", address),
    }
}

/// First non-loopback address of a local interface, in a stable order.
pub fn detect_local_ip() -> crate::Result<IpAddr> {
    let mut addrs: Vec<IpAddr> = get_if_addrs()?
        .into_iter()
        .map(|iface| iface.ip())
        .filter(|ip| !ip.is_loopback())
        .collect();
    addrs.sort_by_key(|ip| (ip.is_ipv6(), *ip));
    addrs.into_iter().next().ok_or_else(|| {
        crate::Error::InvalidConfig(
            "no non-loopback interface found, set watcher.advertise_host".into(),
        )
    })
}
