//! In-memory request tree accumulated over the lifetime of one saga.
//!
//! The tree is arena-allocated: nodes live in a flat `Vec` and refer to each
//! other through [`NodeId`] indices, so parent/child back-references never
//! turn into owning pointers in two directions. Each saga owns its tree
//! exclusively; there is no sharing or locking across sagas.

use bytes::Bytes;

/// Index of a node inside its [`RequestTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

/// Whether an outbound message is a forward transaction or a compensation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Transaction,
    Compensation,
}

impl MessageKind {
    /// Wire value carried in the `X-Qbox-Message-Type` header.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Transaction => "TRANSACTION",
            MessageKind::Compensation => "COMPENSATION",
        }
    }
}

/// An insertion-ordered header map.
///
/// Lookups compare names ASCII case-insensitively; original casing is
/// preserved for forwarding outbound.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Case-insensitive lookup; returns the first matching value.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Set a header, replacing any existing entries with the same
    /// (case-insensitive) name.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.0.push((name, value.into()));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.set(name, value);
        }
        headers
    }
}

impl<const N: usize> From<[(&str, &str); N]> for Headers {
    fn from(entries: [(&str, &str); N]) -> Self {
        entries
            .into_iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }
}

/// One request/response exchange in the tree.
///
/// A node is created with its outbound fields filled in and its response
/// fields empty. Response fields are set at most once, when a dispatch
/// attempt yields a response; they stay empty on terminal timeout or
/// transport failure.
#[derive(Debug, Clone)]
pub struct RequestNode {
    /// Index of the producing spec in `onMatchedRequest`. `None` for the
    /// root node and for compensation nodes.
    pub spec_index: Option<usize>,
    pub method: String,
    pub url: String,
    pub headers: Headers,
    pub body: Bytes,
    pub response_status: Option<u16>,
    pub response_headers: Headers,
    pub response_body: Bytes,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
}

impl RequestNode {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            spec_index: None,
            method: method.into(),
            url: url.into(),
            headers: Headers::new(),
            body: Bytes::new(),
            response_status: None,
            response_headers: Headers::new(),
            response_body: Bytes::new(),
            parent: None,
            children: Vec::new(),
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }
}

/// Arena of [`RequestNode`]s for a single saga.
#[derive(Debug)]
pub struct RequestTree {
    nodes: Vec<RequestNode>,
    root: NodeId,
}

impl RequestTree {
    /// Create a tree seeded with the given root node. The root exists for
    /// the lifetime of the saga.
    pub fn new(root: RequestNode) -> Self {
        Self {
            nodes: vec![root],
            root: NodeId(0),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn insert(&mut self, node: RequestNode) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        id
    }

    pub fn get(&self, id: NodeId) -> &RequestNode {
        &self.nodes[id.0]
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut RequestNode {
        &mut self.nodes[id.0]
    }

    /// Record the response for a node. Response fields are written once.
    pub fn update_response(&mut self, id: NodeId, status: u16, headers: Headers, body: Bytes) {
        let node = self.get_mut(id);
        debug_assert!(node.response_status.is_none(), "response recorded twice");
        node.response_status = Some(status);
        node.response_headers = headers;
        node.response_body = body;
    }

    /// Link `child` under `parent`, appending to the parent's children in
    /// insertion order. A node is attached at most once.
    pub fn attach(&mut self, child: NodeId, parent: NodeId) {
        debug_assert!(self.get(child).parent.is_none(), "node attached twice");
        self.get_mut(child).parent = Some(parent);
        self.get_mut(parent).children.push(child);
    }
}
