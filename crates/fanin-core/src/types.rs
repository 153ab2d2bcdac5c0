//! Domain types shared across Fanin crates.
//!
//! These types describe scrape targets as they are discovered, the label
//! sets injected into their output, and the producers a single
//! aggregation request fans out to.

use std::fmt;

use serde::{Deserialize, Serialize};

// ── Discovery ──────────────────────────────────────────────────────

/// A raw address entry as returned by the cluster directory.
///
/// The node name is optional in the directory's schema; it is checked
/// before the entry becomes a [`NodeIdentity`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointAddress {
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

/// A validated scrape target: a node's address and its name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub ip: String,
    #[serde(rename = "nodeName")]
    pub name: String,
}

impl NodeIdentity {
    pub fn new(ip: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            name: name.into(),
        }
    }
}

// ── Labels ─────────────────────────────────────────────────────────

/// Ordered label name/value pairs injected into every sample line of
/// one fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSet {
    pairs: Vec<(String, String)>,
}

impl LabelSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a label, keeping insertion order.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.pairs.push((name.into(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Render as the text that goes between braces, e.g.
    /// `component="node",node="worker-1"`.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, (name, value)) in self.pairs.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(name);
            out.push_str("=\"");
            out.push_str(&escape_label_value(value));
            out.push('"');
        }
        out
    }
}

impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Escape a label value for the exposition format.
pub fn escape_label_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            _ => out.push(ch),
        }
    }
    out
}

// ── Producers ──────────────────────────────────────────────────────

/// One scrape target for a single aggregation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Producer {
    /// The cluster state service, fetched from a fixed URL.
    State { url: String },
    /// A node exporter, fetched directly from the node's address.
    Node { address: String, name: String },
    /// A node's cadvisor, fetched through the cluster API node proxy.
    CAdvisor { node: String },
}

impl Producer {
    pub fn node(identity: &NodeIdentity) -> Self {
        Producer::Node {
            address: identity.ip.clone(),
            name: identity.name.clone(),
        }
    }

    pub fn cadvisor(identity: &NodeIdentity) -> Self {
        Producer::CAdvisor {
            node: identity.name.clone(),
        }
    }

    /// Value of the `component` label for this producer.
    pub fn component(&self) -> &'static str {
        match self {
            Producer::State { .. } => "state",
            Producer::Node { .. } => "node",
            Producer::CAdvisor { .. } => "cadvisor",
        }
    }

    /// The labels injected into every sample line this producer emits.
    pub fn labels(&self) -> LabelSet {
        let labels = LabelSet::new().with("component", self.component());
        match self {
            Producer::State { .. } => labels,
            Producer::Node { name, .. } => labels.with("node", name),
            Producer::CAdvisor { node } => labels.with("node", node),
        }
    }
}

impl fmt::Display for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Producer::State { url } => write!(f, "state {url}"),
            Producer::Node { address, name } => write!(f, "node {name} ({address})"),
            Producer::CAdvisor { node } => write!(f, "cadvisor {node}"),
        }
    }
}
