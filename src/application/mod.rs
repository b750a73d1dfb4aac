//! Application layer: the decision logic of the payment path.
//!
//! `PaymentRouter` is the entry point for initiating a charge. It routes with
//! `RoutingResolver`, drives attempts through `RetryController`, which takes
//! clients from `CredentialGate` and labels failures with `ErrorClassifier`.
//! `IdempotentEventConsumer` is the entry point of the event path.

pub mod classifier;
pub mod consumer;
pub mod engine;
pub mod gate;
pub mod retry;
pub mod routing;
