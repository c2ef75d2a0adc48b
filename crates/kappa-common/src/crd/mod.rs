//! Custom Resource Definitions consumed and produced by kappa
//!
//! - [`App`] is the single input resource.
//! - [`VirtualService`] and [`DestinationRule`] are the Istio resources derived
//!   from it; the three core kinds come from `k8s_openapi`.

mod app;
mod istio;

pub use app::{
    App, AppSpec, AppStatus, EnvVar, HealthCheckType, WorkloadCondition, DEFAULT_CPU,
    DEFAULT_MEMORY, DEFAULT_PORT,
};
pub use istio::{
    ClientTlsSettings, CorsPolicy, Destination, DestinationRule, DestinationRuleSpec,
    HeaderOperations, Headers, HttpMatchRequest, HttpRoute, HttpRouteDestination,
    LoadBalancerSettings, PortSelector, SimpleLb, StringMatch, TlsMode, TrafficPolicy,
    VirtualService, VirtualServiceSpec,
};
