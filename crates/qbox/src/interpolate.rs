//! The `${...}` template language used in saga configuration.
//!
//! Configured URLs, header values, and bodies may reference data from the
//! request tree: the root request, the message's parent node, and the list
//! of successfully completed transactions. Resolution never fails; missing
//! data falls back to the expression's `:DEFAULT` suffix, or the empty
//! string when no default is given.
//!
//! ```text
//! ${root.headers.Product-Id}
//! ${parent.response.body:fallback}
//! ${transaction[0].response.headers.Content-Type}
//! ```

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::tree::RequestNode;

/// The tree slice a template is resolved against.
///
/// `transactions` holds the root's current children in dispatch order, so
/// only successful transactions are reachable by index.
pub struct InterpolationContext<'a> {
    pub root: &'a RequestNode,
    pub parent: &'a RequestNode,
    pub transactions: Vec<&'a RequestNode>,
}

const HEADER: &str = "[A-Za-z0-9_-]+";

macro_rules! pattern {
    ($body:expr) => {
        Lazy::new(|| Regex::new(&format!(r"(?i)\$\{{{}\}}", $body)).unwrap())
    };
}

static ROOT_HEADERS: Lazy<Regex> = pattern!(format!(r"root\.headers\.({HEADER}):?(.*?)"));
static ROOT_BODY: Lazy<Regex> = pattern!(r"root\.body:?(.*?)");
static PARENT_HEADERS: Lazy<Regex> = pattern!(format!(r"parent\.headers\.({HEADER}):?(.*?)"));
static PARENT_BODY: Lazy<Regex> = pattern!(r"parent\.body:?(.*?)");
static PARENT_RESPONSE_HEADERS: Lazy<Regex> =
    pattern!(format!(r"parent\.response\.headers\.({HEADER}):?(.*?)"));
static PARENT_RESPONSE_BODY: Lazy<Regex> = pattern!(r"parent\.response\.body:?(.*?)");
static TRANSACTION_REQUEST_HEADERS: Lazy<Regex> =
    pattern!(format!(r"transaction\[([0-9]+)\]\.request\.headers\.({HEADER}):?(.*?)"));
static TRANSACTION_RESPONSE_HEADERS: Lazy<Regex> =
    pattern!(format!(r"transaction\[([0-9]+)\]\.response\.headers\.({HEADER}):?(.*?)"));
static TRANSACTION_REQUEST_BODY: Lazy<Regex> =
    pattern!(r"transaction\[([0-9]+)\]\.request\.body:?(.*?)");
static TRANSACTION_RESPONSE_BODY: Lazy<Regex> =
    pattern!(r"transaction\[([0-9]+)\]\.response\.body:?(.*?)");

impl InterpolationContext<'_> {
    /// Resolve every recognised expression in `input`, left to right.
    ///
    /// Substitution is one pass per pattern family; substituted text is not
    /// expanded again. A string with no `${...}` patterns comes back
    /// unchanged.
    pub fn interpolate(&self, input: &str) -> String {
        if input.is_empty() {
            return String::new();
        }

        let out = replace(input, &ROOT_HEADERS, |caps| {
            header_or_default(self.root, caps, 1, 2)
        });
        let out = replace(&out, &ROOT_BODY, |caps| {
            body_or_default(self.root, caps, 1)
        });
        let out = replace(&out, &PARENT_HEADERS, |caps| {
            header_or_default(self.parent, caps, 1, 2)
        });
        let out = replace(&out, &PARENT_BODY, |caps| {
            body_or_default(self.parent, caps, 1)
        });
        let out = replace(&out, &PARENT_RESPONSE_HEADERS, |caps| {
            response_header_or_default(self.parent, caps, 1, 2)
        });
        let out = replace(&out, &PARENT_RESPONSE_BODY, |caps| {
            response_body_or_default(self.parent, caps, 1)
        });
        let out = replace(&out, &TRANSACTION_REQUEST_HEADERS, |caps| {
            match self.transaction(caps) {
                Some(node) => header_or_default(node, caps, 2, 3),
                None => caps[3].to_string(),
            }
        });
        let out = replace(&out, &TRANSACTION_RESPONSE_HEADERS, |caps| {
            match self.transaction(caps) {
                Some(node) => response_header_or_default(node, caps, 2, 3),
                None => caps[3].to_string(),
            }
        });
        let out = replace(&out, &TRANSACTION_REQUEST_BODY, |caps| {
            match self.transaction(caps) {
                Some(node) => body_or_default(node, caps, 2),
                None => caps[2].to_string(),
            }
        });
        replace(&out, &TRANSACTION_RESPONSE_BODY, |caps| {
            match self.transaction(caps) {
                Some(node) => response_body_or_default(node, caps, 2),
                None => caps[2].to_string(),
            }
        })
    }

    /// Index into the completed-transaction list; out of range is `None`.
    fn transaction(&self, caps: &Captures) -> Option<&RequestNode> {
        let index: usize = caps[1].parse().ok()?;
        self.transactions.get(index).copied()
    }
}

fn replace(input: &str, re: &Regex, resolver: impl Fn(&Captures) -> String) -> String {
    re.replace_all(input, |caps: &Captures| resolver(caps))
        .into_owned()
}

fn header_or_default(node: &RequestNode, caps: &Captures, name: usize, default: usize) -> String {
    node.headers
        .get(&caps[name])
        .map(str::to_string)
        .unwrap_or_else(|| caps[default].to_string())
}

fn response_header_or_default(
    node: &RequestNode,
    caps: &Captures,
    name: usize,
    default: usize,
) -> String {
    node.response_headers
        .get(&caps[name])
        .map(str::to_string)
        .unwrap_or_else(|| caps[default].to_string())
}

fn body_or_default(node: &RequestNode, caps: &Captures, default: usize) -> String {
    if node.body.is_empty() {
        caps[default].to_string()
    } else {
        String::from_utf8_lossy(&node.body).into_owned()
    }
}

fn response_body_or_default(node: &RequestNode, caps: &Captures, default: usize) -> String {
    if node.response_body.is_empty() {
        caps[default].to_string()
    } else {
        String::from_utf8_lossy(&node.response_body).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::tree::{Headers, RequestNode};

    fn node() -> RequestNode {
        RequestNode::new("GET", "http://svc/")
    }

    fn ctx<'a>(
        root: &'a RequestNode,
        parent: &'a RequestNode,
        transactions: Vec<&'a RequestNode>,
    ) -> InterpolationContext<'a> {
        InterpolationContext {
            root,
            parent,
            transactions,
        }
    }

    #[test]
    fn plain_strings_pass_through() {
        let root = node();
        let parent = node();
        let ctx = ctx(&root, &parent, vec![]);

        assert_eq!(ctx.interpolate(""), "");
        assert_eq!(ctx.interpolate("no patterns here"), "no patterns here");
        assert_eq!(ctx.interpolate("half ${open"), "half ${open");
    }

    #[test]
    fn root_headers_resolve_case_insensitively() {
        let root = node().with_headers(Headers::from([("Product-Id", "12")]));
        let parent = node();
        let ctx = ctx(&root, &parent, vec![]);

        assert_eq!(ctx.interpolate("${root.headers.Product-Id}"), "12");
        assert_eq!(ctx.interpolate("${ROOT.HEADERS.PRODUCT-ID}"), "12");
        assert_eq!(ctx.interpolate("/add/${root.headers.Product-Id}/x"), "/add/12/x");
    }

    #[test]
    fn missing_data_yields_default_or_empty() {
        let root = node();
        let parent = node();
        let ctx = ctx(&root, &parent, vec![]);

        assert_eq!(ctx.interpolate("${root.headers.Missing}"), "");
        assert_eq!(ctx.interpolate("${root.headers.Missing:fallback}"), "fallback");
        assert_eq!(ctx.interpolate("${parent.headers.FOO:laaa}"), "laaa");
        assert_eq!(ctx.interpolate("${root.body:empty}"), "empty");
        assert_eq!(ctx.interpolate("${parent.response.body}"), "");
    }

    #[test]
    fn empty_context_yields_literal_defaults_for_every_expression() {
        let root = node();
        let parent = node();
        let ctx = ctx(&root, &parent, vec![]);

        for expr in [
            "${root.headers.H:d}",
            "${root.body:d}",
            "${parent.headers.H:d}",
            "${parent.body:d}",
            "${parent.response.headers.H:d}",
            "${parent.response.body:d}",
            "${transaction[0].request.headers.H:d}",
            "${transaction[0].request.body:d}",
            "${transaction[0].response.headers.H:d}",
            "${transaction[0].response.body:d}",
        ] {
            assert_eq!(ctx.interpolate(expr), "d", "expression {expr}");
        }
    }

    #[test]
    fn parent_request_and_response_fields_resolve() {
        let root = node();
        let mut parent = node()
            .with_headers(Headers::from([("MY_OTHER_HEADER", "LIFE")]))
            .with_body(Bytes::from_static(b"request body"));
        parent.response_status = Some(200);
        parent.response_headers = Headers::from([("Content-Type", "application/json")]);
        parent.response_body = Bytes::from_static(b"response body");
        let ctx = ctx(&root, &parent, vec![]);

        assert_eq!(ctx.interpolate("${parent.headers.MY_OTHER_HEADER}"), "LIFE");
        assert_eq!(ctx.interpolate("${parent.body}"), "request body");
        assert_eq!(
            ctx.interpolate("${parent.response.headers.content-type}"),
            "application/json"
        );
        assert_eq!(ctx.interpolate("${parent.response.body}"), "response body");
    }

    #[test]
    fn transaction_indices_resolve_in_dispatch_order() {
        let root = node();
        let parent = node();
        let mut first = node().with_headers(Headers::from([("Sent", "yes")]));
        first.response_body = Bytes::from_static(b"bar");
        let mut second = node().with_body(Bytes::from_static(b"payload"));
        second.response_body = Bytes::from_static(b"foo");
        second.response_headers = Headers::from([("X-Trace", "t1")]);
        let ctx = ctx(&root, &parent, vec![&first, &second]);

        assert_eq!(
            ctx.interpolate(
                "Ratings: ${transaction[0].response.body}\nDetails: ${transaction[1].response.body}\n"
            ),
            "Ratings: bar\nDetails: foo\n"
        );
        assert_eq!(ctx.interpolate("${transaction[0].request.headers.Sent}"), "yes");
        assert_eq!(ctx.interpolate("${transaction[1].request.body}"), "payload");
        assert_eq!(ctx.interpolate("${transaction[1].response.headers.X-Trace}"), "t1");
    }

    #[test]
    fn out_of_range_index_behaves_like_missing_default() {
        let root = node();
        let parent = node();
        let mut only = node();
        only.response_body = Bytes::from_static(b"bar");
        let ctx = ctx(&root, &parent, vec![&only]);

        assert_eq!(ctx.interpolate("${transaction[7].response.body}"), "");
        assert_eq!(ctx.interpolate("${transaction[7].response.body:gone}"), "gone");
        assert_eq!(ctx.interpolate("${transaction[7].request.headers.H:gone}"), "gone");
    }

    #[test]
    fn substituted_text_is_not_expanded_again() {
        let root = node().with_headers(Headers::from([("Outer", "${root.headers.Inner}")]));
        let parent = node();
        let ctx = ctx(&root, &parent, vec![]);

        // One pass per family: the substituted value survives verbatim.
        assert_eq!(ctx.interpolate("${root.headers.Outer}"), "${root.headers.Inner}");
    }
}
