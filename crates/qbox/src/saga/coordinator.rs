//! The coordinator driving one saga to its terminal state.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::seq::SliceRandom;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::client::{ClientError, HttpClient};
use crate::config::{CompensationSpec, ResponseMatch, SagaConfig, TransactionSpec};
use crate::interpolate::InterpolationContext;
use crate::tree::{Headers, MessageKind, NodeId, RequestNode, RequestTree};

/// Reserved header carrying the saga identifier. Injected on every outbound
/// message, overwriting any caller-set value.
pub const TRANSACTION_ID_HEADER: &str = "X-Qbox-TransactionID";

/// Reserved header carrying `TRANSACTION` or `COMPENSATION`.
pub const MESSAGE_TYPE_HEADER: &str = "X-Qbox-Message-Type";

/// Result of a saga run.
///
/// `completed` holds the transactions that succeeded, in dispatch order; a
/// transaction whose response did not match its spec is never included.
#[derive(Debug)]
pub struct SagaOutcome {
    pub success: bool,
    pub completed: Vec<NodeId>,
    pub failed_compensations: Vec<NodeId>,
}

/// Terminal state of a saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaStatus {
    /// Every transaction succeeded.
    AllSucceeded,
    /// A transaction failed and every compensation converged.
    AllCompensated,
    /// A transaction failed and at least one compensation did not converge.
    PartialCompensationFailed,
}

impl SagaOutcome {
    pub fn status(&self) -> SagaStatus {
        if self.success {
            SagaStatus::AllSucceeded
        } else if self.failed_compensations.is_empty() {
            SagaStatus::AllCompensated
        } else {
            SagaStatus::PartialCompensationFailed
        }
    }
}

/// A borrowed view over the fields shared by transaction and compensation
/// specs, so preparation and dispatch handle both uniformly.
struct OutboundSpec<'a> {
    method: &'a str,
    url: &'a str,
    headers: &'a BTreeMap<String, String>,
    body: Option<&'a str>,
    timeout: u64,
    max_retries_on_timeout: Option<u32>,
    expect: &'a [ResponseMatch],
}

impl<'a> From<&'a TransactionSpec> for OutboundSpec<'a> {
    fn from(spec: &'a TransactionSpec) -> Self {
        Self {
            method: &spec.method,
            url: &spec.url,
            headers: &spec.headers,
            body: spec.body.as_deref(),
            timeout: spec.timeout,
            max_retries_on_timeout: spec.max_retries_on_timeout,
            expect: &spec.is_success_if_receives,
        }
    }
}

impl<'a> From<&'a CompensationSpec> for OutboundSpec<'a> {
    fn from(spec: &'a CompensationSpec) -> Self {
        Self {
            method: &spec.method,
            url: &spec.url,
            headers: &spec.headers,
            body: spec.body.as_deref(),
            timeout: spec.timeout,
            max_retries_on_timeout: spec.max_retries_on_timeout,
            expect: &spec.is_success_if_receives,
        }
    }
}

/// Drives one saga: issues transactions, detects success, and issues
/// compensating requests for completed steps when a later one fails.
///
/// A coordinator owns its request tree exclusively and runs strictly
/// sequentially; concurrency lives one level up, across sagas.
pub struct SagaCoordinator {
    config: Arc<SagaConfig>,
    client: Arc<dyn HttpClient>,
    identifier: Uuid,
    tree: RequestTree,
    shuffle: bool,
}

impl SagaCoordinator {
    /// Create a coordinator seeded with the inbound request's headers and
    /// body as the root of the request tree.
    pub fn new(
        config: Arc<SagaConfig>,
        client: Arc<dyn HttpClient>,
        root_headers: Headers,
        root_body: Bytes,
    ) -> Self {
        let root = RequestNode::new(
            config.match_request.method.clone(),
            config.match_request.url.clone(),
        )
        .with_headers(root_headers)
        .with_body(root_body);

        Self {
            config,
            client,
            identifier: Uuid::new_v4(),
            tree: RequestTree::new(root),
            shuffle: false,
        }
    }

    /// Dispatch transactions in randomised order instead of configuration
    /// order. Compensation order and interpolation indices still follow
    /// dispatch order.
    pub fn with_shuffled_dispatch(mut self) -> Self {
        self.shuffle = true;
        self
    }

    pub fn identifier(&self) -> Uuid {
        self.identifier
    }

    pub fn tree(&self) -> &RequestTree {
        &self.tree
    }

    pub fn root(&self) -> NodeId {
        self.tree.root()
    }

    /// Run the saga to its terminal state.
    ///
    /// Transactions are dispatched one after another. The first failure
    /// halts forward progress and triggers compensation of every completed
    /// transaction, in the order they completed, and then of the failing
    /// step itself. Only the completed transactions appear in the outcome.
    pub async fn execute(&mut self) -> SagaOutcome {
        let config = Arc::clone(&self.config);
        let root = self.tree.root();

        let mut order: Vec<usize> = (0..config.on_matched_request.len()).collect();
        if self.shuffle {
            order.shuffle(&mut rand::rng());
        }

        info!(
            saga_id = %self.identifier,
            transactions = order.len(),
            "starting saga"
        );

        for index in order {
            let spec = OutboundSpec::from(&config.on_matched_request[index]);
            let node = self.prepare(&spec, root, MessageKind::Transaction, Some(index));
            self.dispatch(node, &spec, MessageKind::Transaction).await;

            if self.is_successful(node, spec.expect) {
                debug!(
                    saga_id = %self.identifier,
                    url = %self.tree.get(node).url,
                    "transaction succeeded"
                );
                self.tree.attach(node, root);
            } else {
                warn!(
                    saga_id = %self.identifier,
                    url = %self.tree.get(node).url,
                    status = ?self.tree.get(node).response_status,
                    "transaction failed, compensating completed steps"
                );
                let completed = self.tree.get(root).children.clone();
                // The failing step is compensated too: its downstream may
                // have applied side effects before answering with a
                // non-matching response.
                let mut to_compensate = completed.clone();
                to_compensate.push(node);
                let failed_compensations = self.compensate(&to_compensate).await;
                let outcome = SagaOutcome {
                    success: false,
                    completed,
                    failed_compensations,
                };
                info!(saga_id = %self.identifier, status = ?outcome.status(), "saga finished");
                return outcome;
            }
        }

        let outcome = SagaOutcome {
            success: true,
            completed: self.tree.get(root).children.clone(),
            failed_compensations: Vec::new(),
        };
        info!(saga_id = %self.identifier, status = ?outcome.status(), "saga finished");
        outcome
    }

    /// Issue the compensations of the given transactions, in the same order
    /// the transactions were dispatched. Compensations that converge are
    /// attached under the transaction they undo; the rest are reported.
    async fn compensate(&mut self, transactions: &[NodeId]) -> Vec<NodeId> {
        let config = Arc::clone(&self.config);
        let mut failed = Vec::new();

        for &transaction in transactions {
            let Some(spec_index) = self.tree.get(transaction).spec_index else {
                debug_assert!(false, "transaction node without a spec index");
                continue;
            };

            for compensation in &config.on_matched_request[spec_index].on_failure {
                let spec = OutboundSpec::from(compensation);
                let node = self.prepare(&spec, transaction, MessageKind::Compensation, None);
                self.dispatch(node, &spec, MessageKind::Compensation).await;

                if self.is_successful(node, spec.expect) {
                    debug!(
                        saga_id = %self.identifier,
                        url = %self.tree.get(node).url,
                        "compensation succeeded"
                    );
                    self.tree.attach(node, transaction);
                } else {
                    error!(
                        saga_id = %self.identifier,
                        url = %self.tree.get(node).url,
                        status = ?self.tree.get(node).response_status,
                        "compensation failed"
                    );
                    failed.push(node);
                }
            }
        }

        failed
    }

    /// Resolve a spec into a concrete outbound message and allocate its
    /// node. The completed-transaction list is always empty at preparation
    /// time; only the final response templates see it populated.
    fn prepare(
        &mut self,
        spec: &OutboundSpec<'_>,
        parent: NodeId,
        kind: MessageKind,
        spec_index: Option<usize>,
    ) -> NodeId {
        let context = InterpolationContext {
            root: self.tree.get(self.tree.root()),
            parent: self.tree.get(parent),
            transactions: Vec::new(),
        };

        let url = context.interpolate(spec.url);
        let mut headers = Headers::new();
        for (name, value) in spec.headers {
            headers.set(name.clone(), context.interpolate(value));
        }
        let body = spec
            .body
            .map(|body| context.interpolate(body))
            .unwrap_or_default();

        headers.set(TRANSACTION_ID_HEADER, self.identifier.to_string());
        headers.set(MESSAGE_TYPE_HEADER, kind.as_str());

        let mut node = RequestNode::new(spec.method, url)
            .with_headers(headers)
            .with_body(body);
        node.spec_index = spec_index;
        self.tree.insert(node)
    }

    /// Dispatch with the timeout retry loop.
    ///
    /// `maxRetriesOnTimeout` counts total attempts; `0` is normalised to
    /// one attempt. When absent, transactions get a single attempt (a
    /// timed-out transaction leaves the peer in an unknown state, so more
    /// attempts are an explicit operator choice) and compensations retry
    /// until they converge.
    async fn dispatch(&mut self, node: NodeId, spec: &OutboundSpec<'_>, kind: MessageKind) {
        let timeout = Duration::from_millis(spec.timeout);
        let max_attempts = match (spec.max_retries_on_timeout, kind) {
            (Some(0), _) => Some(1),
            (Some(n), _) => Some(n),
            (None, MessageKind::Transaction) => Some(1),
            (None, MessageKind::Compensation) => None,
        };

        let client = Arc::clone(&self.client);
        let (method, url, headers, body) = {
            let prepared = self.tree.get(node);
            (
                prepared.method.clone(),
                prepared.url.clone(),
                prepared.headers.clone(),
                prepared.body.clone(),
            )
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match client
                .execute(&method, &url, &headers, body.clone(), timeout)
                .await
            {
                Ok(response) => {
                    debug!(
                        saga_id = %self.identifier,
                        %url,
                        status = response.status,
                        attempt,
                        "received response"
                    );
                    self.tree
                        .update_response(node, response.status, response.headers, response.body);
                    return;
                }
                Err(ClientError::Timeout(_)) => {
                    warn!(saga_id = %self.identifier, %url, attempt, "attempt timed out");
                    if let Some(max) = max_attempts {
                        if attempt >= max {
                            return;
                        }
                    }
                }
                Err(ClientError::Transport(reason)) => {
                    // Treated as a non-matching response; the retry loop is
                    // only for timeouts.
                    warn!(saga_id = %self.identifier, %url, %reason, "transport failure");
                    return;
                }
            }
        }
    }

    /// True iff the node received a response matching one of the expected
    /// responses. Expected header values and bodies are interpolated with
    /// the node itself as parent; an empty header map or missing body
    /// imposes no constraint.
    fn is_successful(&self, node: NodeId, expected: &[ResponseMatch]) -> bool {
        let candidate = self.tree.get(node);
        let Some(status) = candidate.response_status else {
            return false;
        };

        let context = InterpolationContext {
            root: self.tree.get(self.tree.root()),
            parent: candidate,
            transactions: Vec::new(),
        };

        expected.iter().any(|expectation| {
            if status != expectation.status_code {
                return false;
            }
            for (name, value) in &expectation.headers {
                let want = context.interpolate(value);
                if candidate.response_headers.get(name) != Some(want.as_str()) {
                    return false;
                }
            }
            if let Some(body) = &expectation.body {
                let want = context.interpolate(body);
                if !want.is_empty() && candidate.response_body != want.as_bytes() {
                    return false;
                }
            }
            true
        })
    }
}
