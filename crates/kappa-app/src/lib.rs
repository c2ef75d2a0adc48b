//! App reconciliation for kappa
//!
//! Turns one App into five derived objects and keeps them converged:
//! - Identity: ServiceAccount
//! - Workload: Deployment
//! - Endpoint: Service
//! - RoutingRule: Istio VirtualService
//! - TrafficPolicy: Istio DestinationRule
//!
//! Each kind has a pure builder (App to desired object) and a reconciler that
//! reads the observed object through [`AppKubeClient`] and creates, replaces
//! or leaves it. Workload and Endpoint have their own evaluators with subset
//! rules for metadata; the Istio kinds compare their specs exactly; the
//! Identity is always rewritten.

#![deny(missing_docs)]

pub mod client;
pub mod controller;
pub mod converge;
pub mod endpoint;
pub mod equality;
pub mod identity;
pub mod routing;
pub mod traffic;
pub mod workload;

#[cfg(test)]
mod testing;

pub use client::{AppKubeClient, AppKubeClientImpl};
pub use controller::{error_policy, reconcile, AppContext, ControllerConfig};
pub use converge::{Outcome, Plan, ResourceKind};
pub use equality::{Drift, Evaluation};
