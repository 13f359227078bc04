use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Gvk, Identity};

/// Equality-based label selector (`matchLabels`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector(BTreeMap<String, String>);

impl LabelSelector {
    pub fn new() -> Self { Self::default() }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.0.insert(key.to_string(), value.to_string());
        self
    }

    pub fn from_labels(labels: &BTreeMap<String, String>) -> Self { Self(labels.clone()) }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub fn labels(&self) -> &BTreeMap<String, String> { &self.0 }

    /// An empty selector matches everything.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0.iter().all(|(k, v)| labels.get(k) == Some(v))
    }
}

/// Renders the list-query form `k1=v1,k2=v2`.
impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.0 {
            if !first { f.write_str(",")?; }
            write!(f, "{}={}", k, v)?;
            first = false;
        }
        Ok(())
    }
}

/// Declarative read request resolved by the observer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Observable {
    /// Point lookup by identity.
    Get(Identity),
    /// Set lookup by kind and selector; `namespace: None` lists across namespaces.
    List { kind: Gvk, namespace: Option<String>, selector: LabelSelector },
}
