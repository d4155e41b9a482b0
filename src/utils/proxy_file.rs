// src/utils/proxy_file.rs

//! Loader for the `host:port:username:password` proxy wire format.

use std::path::Path;

use tracing::warn;

use crate::error::Result;
use crate::models::Proxy;

/// Load proxies from a wire-format file, one per line. Blank and invalid
/// lines are reported and skipped.
pub fn load_proxies(path: &Path) -> Result<Vec<Proxy>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(parse_proxies(&contents))
}

/// Parse wire-format proxy lines.
pub fn parse_proxies(contents: &str) -> Vec<Proxy> {
    let mut proxies = Vec::new();

    for (number, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match parse_proxy_line(line) {
            Some(proxy) => proxies.push(proxy),
            None => warn!(line = number + 1, "skipping invalid proxy line"),
        }
    }

    proxies
}

fn parse_proxy_line(line: &str) -> Option<Proxy> {
    let mut fields = line.split(':');
    let host = fields.next()?.to_string();
    let port: u32 = fields.next()?.parse().ok()?;
    let username = fields.next()?.to_string();
    let password = fields.next()?.to_string();

    if fields.next().is_some() {
        return None;
    }

    let proxy = Proxy {
        host,
        port,
        username,
        password,
    };
    proxy.validate().ok()?;

    Some(proxy)
}
