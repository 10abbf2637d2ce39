#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use capacity_controller_core as core;
pub use capacity_controller_k8s_api as k8s;
pub use capacity_controller_k8s_index as index;

mod admission;
mod args;
mod certs;
mod decision;
mod metrics;
mod patch;
mod register;

pub use self::{
    admission::Admission,
    args::Args,
    decision::{Decision, Engine, Skip},
    metrics::AdmissionMetrics,
};
