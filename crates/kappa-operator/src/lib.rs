//! kappa operator: CRD installation and the App controller runner

#![deny(missing_docs)]

pub mod controller_runner;
pub mod startup;
