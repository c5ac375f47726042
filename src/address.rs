//! Parsing of client-requested addresses into routing targets

use regex::Regex;
use std::collections::HashMap;

/// Where a client session should be sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingTarget {
    /// Statically configured server, never started or stopped by the broker
    Fixed { port: u16 },
    /// Backend resolved through the registry
    Dynamic { identifier: String },
    /// Address matches no known pattern
    Invalid,
}

/// Static hostname table plus the `<digits>.<domain>` pattern
#[derive(Debug, Clone)]
pub struct RouteTable {
    fixed: HashMap<String, u16>,
    dynamic: Regex,
}

impl RouteTable {
    pub fn new(fixed: HashMap<String, u16>, domain: &str) -> Result<Self, regex::Error> {
        let fixed = fixed
            .into_iter()
            .map(|(host, port)| (host.to_ascii_lowercase(), port))
            .collect();
        // [0-9] rather than \d, which would also accept non-ASCII digits
        let pattern = format!(
            r"^([0-9]+)\.{}$",
            regex::escape(&domain.to_ascii_lowercase())
        );
        Ok(Self {
            fixed,
            dynamic: Regex::new(&pattern)?,
        })
    }

    /// Parse a host into a routing target. Pure and total.
    pub fn parse(&self, host: &str) -> RoutingTarget {
        if let Some(port) = self.fixed.get(host) {
            return RoutingTarget::Fixed { port: *port };
        }

        match self.dynamic.captures(host).and_then(|caps| caps.get(1)) {
            Some(digits) => RoutingTarget::Dynamic {
                identifier: digits.as_str().to_string(),
            },
            None => RoutingTarget::Invalid,
        }
    }

    /// Parse a raw requested address, discarding any port or path
    pub fn resolve_address(&self, address: &str) -> RoutingTarget {
        self.parse(&host_portion(address))
    }
}

/// Host portion of a requested address, lowercased
pub fn host_portion(address: &str) -> String {
    let address = address.trim();
    let end = address.find(['/', ':']).unwrap_or(address.len());
    address[..end].to_ascii_lowercase()
}
