//! Per-host request policy: firewall, facet rules and path rewriting.

use std::collections::BTreeMap;

use crate::config::HostEntry;

pub mod firewall;
pub mod rewrite;
pub mod rules;

pub use firewall::Firewall;
pub use rewrite::Rewrite;
pub use rules::{Facet, RuleSet};

/// A flat name → value view of one request facet. Later duplicates win.
pub type Fields = BTreeMap<String, String>;

/// Everything a host entry configures beyond its backends, compiled once.
#[derive(Debug, Default)]
pub struct HostPolicy {
    firewall: Option<Firewall>,
    header_rules: Option<RuleSet>,
    param_rules: Option<RuleSet>,
    post_data_rules: Option<RuleSet>,
    cookie_rules: Option<RuleSet>,
    rewrite: Option<Rewrite>,
}

impl From<&HostEntry> for HostPolicy {
    fn from(entry: &HostEntry) -> Self {
        Self {
            firewall: entry.firewall_rules.as_ref().map(Firewall::from),
            header_rules: entry.header_rules.as_ref().map(RuleSet::from),
            param_rules: entry.param_rules.as_ref().map(RuleSet::from),
            post_data_rules: entry.post_data_rules.as_ref().map(RuleSet::from),
            cookie_rules: entry.cookie_rules.as_ref().map(RuleSet::from),
            rewrite: entry.rewrite_rules.as_ref().map(Rewrite::from),
        }
    }
}

impl HostPolicy {
    /// A host without firewall rules allows everything.
    pub fn allow(&self, client_ip: &str, path: &str, headers: &Fields) -> bool {
        self.firewall
            .as_ref()
            .map_or(true, |firewall| firewall.allow(client_ip, path, headers))
    }

    pub fn rules(&self, facet: Facet) -> Option<&RuleSet> {
        match facet {
            Facet::Header => self.header_rules.as_ref(),
            Facet::Param => self.param_rules.as_ref(),
            Facet::PostData => self.post_data_rules.as_ref(),
            Facet::Cookie => self.cookie_rules.as_ref(),
        }
    }

    /// Applies the facet's rules, or returns `values` unchanged when there are none.
    pub fn apply(&self, facet: Facet, values: Fields) -> Fields {
        match self.rules(facet) {
            Some(rules) => rules.apply(facet, values),
            None => values,
        }
    }

    pub fn rewrite_path(&self, path: &str) -> String {
        match &self.rewrite {
            Some(rewrite) => rewrite.rewrite_path(path),
            None => path.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(yaml: &str) -> HostEntry {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_policy_without_rules() {
        let policy = HostPolicy::from(&entry("host: www.metallica.com\nservers: [localhost:9081]"));

        let mut headers = Fields::new();
        headers.insert("Host".to_string(), "www.metallica.com".to_string());

        assert!(policy.allow("10.192.0.1", "/messages", &headers));
        assert_eq!(headers, policy.apply(Facet::Header, headers.clone()));
        assert!(policy.rules(Facet::Cookie).is_none());
        assert_eq!("v1", policy.rewrite_path("v1"));
    }

    #[test]
    fn test_policy_from_host_entry() {
        let policy = HostPolicy::from(&entry(
            r#"
host: www.anthrax.com
servers: [localhost:8081]
firewall_rules:
  ip_reject: [10.192.0.1]
param_rules:
  add:
    MyCustomParam: Test
  remove:
    RemoveMe: Remove
rewrite_rules:
  replace:
    v1: v2
"#,
        ));

        assert!(!policy.allow("10.192.0.1", "/", &Fields::new()));
        assert!(policy.allow("10.192.0.3", "/", &Fields::new()));

        let mut params = Fields::new();
        params.insert("RemoveMe".to_string(), "Remove".to_string());
        let params = policy.apply(Facet::Param, params);
        assert_eq!(Some(&"Test".to_string()), params.get("MyCustomParam"));
        assert!(!params.contains_key("RemoveMe"));

        // no header rules configured for this host
        assert!(policy.rules(Facet::Header).is_none());
        assert_eq!("v2", policy.rewrite_path("v1"));
    }
}
