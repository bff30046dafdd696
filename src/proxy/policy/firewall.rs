use std::{collections::HashSet, net::IpAddr};

use ipnetwork::IpNetwork;

use crate::config;

use super::Fields;

#[derive(Debug)]
enum IpRule {
    Network(IpNetwork),
    Literal(String),
}

impl IpRule {
    fn matches(&self, client_ip: &str, parsed: Option<IpAddr>) -> bool {
        match self {
            IpRule::Network(network) => parsed.is_some_and(|ip| network.contains(ip)),
            IpRule::Literal(literal) => literal == client_ip,
        }
    }
}

impl From<&str> for IpRule {
    fn from(value: &str) -> Self {
        match value.parse::<IpNetwork>() {
            Ok(network) => IpRule::Network(network),
            Err(_) => IpRule::Literal(value.to_string()),
        }
    }
}

/// Per-host reject lists. Reject conditions are OR-ed; the first match wins.
#[derive(Debug, Default)]
pub struct Firewall {
    ip_reject: Vec<IpRule>,
    path_reject: HashSet<String>,
    header_reject: Vec<(String, HashSet<String>)>,
}

impl From<&config::FirewallRules> for Firewall {
    fn from(value: &config::FirewallRules) -> Self {
        Self {
            ip_reject: value.ip_reject.iter().map(|s| IpRule::from(s.as_str())).collect(),
            path_reject: value.path_reject.iter().cloned().collect(),
            header_reject: value
                .header_reject
                .iter()
                .map(|(name, values)| (name.clone(), values.iter().cloned().collect()))
                .collect(),
        }
    }
}

impl Firewall {
    pub fn allow(&self, client_ip: &str, path: &str, headers: &Fields) -> bool {
        let parsed = client_ip.parse::<IpAddr>().ok();
        if self.ip_reject.iter().any(|rule| rule.matches(client_ip, parsed)) {
            log::info!("Firewall rejected client {client_ip}");
            return false;
        }

        if self.path_reject.contains(path) {
            log::info!("Firewall rejected path {path}");
            return false;
        }

        for (name, rejected) in &self.header_reject {
            let hit = headers
                .iter()
                .any(|(k, v)| k.eq_ignore_ascii_case(name) && rejected.contains(v));
            if hit {
                log::info!("Firewall rejected header {name}");
                return false;
            }
        }

        true
    }
}
