//! Create / replace / keep decision shared by every derived kind
//!
//! Each kind is in one of three states relative to its App: Absent (no
//! object), Divergent (the kind's evaluator reports a [`Drift`]) or Converged.
//! [`plan`] maps those states onto the write to perform.

use std::fmt;

use kappa_common::kube_utils::carry_identity;
use kube::Resource;

use crate::equality::{Drift, Evaluation};

/// The five kinds derived from an App, in reconcile order
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    /// ServiceAccount the pods run as
    Identity,
    /// Deployment running the container
    Workload,
    /// Service fronting the pods
    Endpoint,
    /// Istio VirtualService
    RoutingRule,
    /// Istio DestinationRule
    TrafficPolicy,
}

impl ResourceKind {
    /// Kubernetes kind written for this resource
    pub fn api_kind(self) -> &'static str {
        match self {
            ResourceKind::Identity => "ServiceAccount",
            ResourceKind::Workload => "Deployment",
            ResourceKind::Endpoint => "Service",
            ResourceKind::RoutingRule => "VirtualService",
            ResourceKind::TrafficPolicy => "DestinationRule",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.api_kind())
    }
}

/// Write to perform for one kind
#[derive(Clone, Debug, PartialEq)]
pub enum Plan<K> {
    /// Nothing observed: create the desired object
    Create(K),
    /// Observed object differs: replace it wholesale with the desired object,
    /// which already carries the observed resourceVersion and uid
    Replace(K, Drift),
    /// Observed object matches
    Keep,
}

/// Decide what to write for one kind.
///
/// `evaluate(desired, observed)` is the kind's equality evaluator.
pub fn plan<K, F>(mut desired: K, observed: Option<&K>, evaluate: F) -> Plan<K>
where
    K: Resource,
    F: FnOnce(&K, &K) -> Evaluation,
{
    let Some(observed) = observed else {
        return Plan::Create(desired);
    };
    match evaluate(&desired, observed) {
        Ok(()) => Plan::Keep,
        Err(drift) => {
            carry_identity(&mut desired, observed);
            Plan::Replace(desired, drift)
        }
    }
}

/// What a per-kind reconciler did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The object did not exist and was created
    Created,
    /// The object differed and was replaced
    Replaced,
    /// The object already matched
    Unchanged,
}
