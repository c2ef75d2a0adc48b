//! Common types for kappa: CRDs, errors, and kube utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod telemetry;

pub use error::{Error, ErrorClass};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Label key carrying the App name on every derived object and pod
pub const APP_LABEL: &str = "app";

/// Default field manager used for CRD installation and status patches
pub const DEFAULT_FIELD_MANAGER: &str = "kappa-controller";
