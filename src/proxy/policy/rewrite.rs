use crate::config;

/// Literal path substitutions; only the first configured pair is ever applied.
#[derive(Debug, Default)]
pub struct Rewrite {
    replace: Vec<(String, String)>,
}

impl From<&config::RewriteRules> for Rewrite {
    fn from(value: &config::RewriteRules) -> Self {
        Self {
            replace: value.replace.clone(),
        }
    }
}

impl Rewrite {
    pub fn rewrite_path(&self, path: &str) -> String {
        match self.replace.first() {
            Some((current, new)) => path.replace(current.as_str(), new),
            None => path.to_string(),
        }
    }
}
