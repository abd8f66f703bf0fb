use std::path::Path;

use tracing::{info, warn};

use crate::error::{AppError, Result};

/// One proxy from the static list file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl ProxyConfig {
    /// `scheme://host:port` without credentials, as browsers expect it.
    pub fn server_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }

    /// Short identity used in logs and slot labels.
    pub fn label(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_socks(&self) -> bool {
        self.scheme.starts_with("socks")
    }

    /// SOCKS credentials travel in the URL; HTTP proxies get Proxy-Authorization.
    pub fn to_reqwest(&self) -> Result<reqwest::Proxy> {
        if self.is_socks() {
            let url = format!(
                "{}://{}:{}@{}:{}",
                self.scheme, self.username, self.password, self.host, self.port
            );
            Ok(reqwest::Proxy::all(url)?)
        } else {
            Ok(reqwest::Proxy::all(self.server_url())?.basic_auth(&self.username, &self.password))
        }
    }
}

/// Parse `scheme:host:port:username:password`. The password may itself contain ':'.
pub fn parse_proxy_line(line: &str) -> Option<ProxyConfig> {
    let mut parts = line.trim().splitn(5, ':');
    let scheme = parts.next()?.trim().to_ascii_lowercase();
    let host = parts.next()?.trim().to_string();
    let port = parts.next()?.trim().parse::<u16>().ok()?;
    let username = parts.next()?.trim().to_string();
    let password = parts.next()?.trim().to_string();

    if !matches!(scheme.as_str(), "http" | "https" | "socks5" | "socks5h") {
        return None;
    }
    if host.is_empty() || port == 0 {
        return None;
    }

    Some(ProxyConfig {
        scheme,
        host,
        port,
        username,
        password,
    })
}

/// Parse a whole proxy list. Blank lines and `#` comments are ignored, malformed
/// lines are skipped with a warning.
pub fn parse_proxy_list(contents: &str) -> Vec<ProxyConfig> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| {
            let t = line.trim();
            !t.is_empty() && !t.starts_with('#')
        })
        .filter_map(|(idx, line)| {
            let parsed = parse_proxy_line(line);
            if parsed.is_none() {
                warn!(line = idx + 1, "[PROXY] skipping malformed proxy line");
            }
            parsed
        })
        .collect()
}

/// Load the proxy list file. An empty result is fatal for any pool built from it.
pub fn load_proxies(path: impl AsRef<Path>) -> Result<Vec<ProxyConfig>> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)?;
    let proxies = parse_proxy_list(&contents);
    if proxies.is_empty() {
        return Err(AppError::NoProxies(format!(
            "{} contains no usable proxy lines",
            path.display()
        )));
    }
    info!("Loaded {} proxies from {}", proxies.len(), path.display());
    Ok(proxies)
}
