//! Credential extraction and network allow-lists.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use http::HeaderMap;
use ipnet::IpNet;
use std::net::IpAddr;
use std::str::FromStr;

/// Frontend credentials as presented by the client.
///
/// Extraction precedence, first match wins:
/// `X-ClickHouse-User`/`X-ClickHouse-Key` headers, HTTP Basic auth,
/// URL parameters `user`/`password`, then the fallback username
/// `default` with an empty password.
pub fn extract_credentials(headers: &HeaderMap, params: &[(String, String)]) -> (String, String) {
    if let Some(user) = header_str(headers, "x-clickhouse-user") {
        let key = header_str(headers, "x-clickhouse-key").unwrap_or_default();
        return (user.to_string(), key.to_string());
    }

    if let Some(value) = header_str(headers, "authorization") {
        if let Some(encoded) = value.strip_prefix("Basic ") {
            if let Ok(decoded) = BASE64.decode(encoded.trim()) {
                if let Ok(pair) = String::from_utf8(decoded) {
                    let (user, password) = pair.split_once(':').unwrap_or((pair.as_str(), ""));
                    return (user.to_string(), password.to_string());
                }
            }
        }
    }

    let user = param(params, "user");
    let password = param(params, "password");
    if let Some(user) = user {
        return (user.to_string(), password.unwrap_or_default().to_string());
    }

    ("default".to_string(), String::new())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn param<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

/// A network allow-list. Empty means "allow everyone".
#[derive(Debug, Clone, Default)]
pub struct Networks(Vec<IpNet>);

impl Networks {
    pub fn parse(entries: &[String]) -> Result<Self, String> {
        let mut nets = Vec::with_capacity(entries.len());
        for entry in entries {
            let net = if let Ok(net) = IpNet::from_str(entry) {
                net
            } else if let Ok(addr) = IpAddr::from_str(entry) {
                // A bare address allows exactly that host.
                IpNet::new(addr, if addr.is_ipv4() { 32 } else { 128 })
                    .map_err(|err| format!("invalid network {entry:?}: {err}"))?
            } else {
                return Err(format!("invalid network {entry:?}"));
            };
            nets.push(net);
        }
        Ok(Self(nets))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when the allow-list is empty or contains the address.
    pub fn allows(&self, addr: IpAddr) -> bool {
        self.0.is_empty() || self.0.iter().any(|net| net.contains(&addr))
    }
}
