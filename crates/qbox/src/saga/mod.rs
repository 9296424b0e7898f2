//! Saga execution engine for distributed transactions over HTTP.
//!
//! A saga is a sequence of downstream HTTP calls with compensating actions.
//! The coordinator dispatches the configured transactions one after another;
//! if any of them fails, it stops and issues the compensations of every
//! transaction that already completed.
//!
//! # Example
//!
//! ```yaml
//! host: productpage.svc
//! matchRequest:
//!   method: GET
//!   url: http://localhost:3001/
//!   headers:
//!     Hey-Qbox: Begin-Transaction
//! onMatchedRequest:
//!   - method: GET
//!     url: http://ratings.svc/add/${parent.headers.Product-Id}
//!     timeout: 30000
//!     isSuccessIfReceives:
//!       - status-code: 200
//!     onFailure:
//!       - method: GET
//!         url: http://ratings.svc/delete/${root.headers.Product-Id}
//!         timeout: 3000
//!         isSuccessIfReceives:
//!           - status-code: 200
//! onAllSucceeded:
//!   status-code: 200
//!   body: "Ratings: ${transaction[0].response.body}"
//! ```

mod coordinator;

pub use coordinator::{
    SagaCoordinator, SagaOutcome, SagaStatus, MESSAGE_TYPE_HEADER, TRANSACTION_ID_HEADER,
};
