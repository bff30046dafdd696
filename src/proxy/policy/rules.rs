use crate::config;

use super::Fields;

/// The request parts a host's rules can edit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Facet {
    Header,
    Param,
    PostData,
    Cookie,
}

impl Facet {
    // header names are case-insensitive, everything else is matched exactly
    fn same_key(&self, a: &str, b: &str) -> bool {
        match self {
            Facet::Header => a.eq_ignore_ascii_case(b),
            Facet::Param | Facet::PostData | Facet::Cookie => a == b,
        }
    }
}

#[derive(Debug, Default)]
pub struct RuleSet {
    add: Vec<(String, String)>,
    remove: Vec<String>,
}

impl From<&config::FacetRules> for RuleSet {
    fn from(value: &config::FacetRules) -> Self {
        Self {
            add: value.add.clone(),
            remove: value.remove.clone(),
        }
    }
}

impl RuleSet {
    /// Upserts every `add` pair, then deletes every `remove` key.
    pub fn apply(&self, facet: Facet, mut values: Fields) -> Fields {
        for (key, value) in &self.add {
            values.retain(|k, _| !facet.same_key(k, key));
            values.insert(key.clone(), value.clone());
        }

        for key in &self.remove {
            values.retain(|k, _| !facet.same_key(k, key));
        }

        values
    }
}
