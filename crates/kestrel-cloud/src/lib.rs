//! Cloud access for the kestrel cluster engine
//!
//! The engine talks to Azure (or Azure Stack) only through the [`CloudClient`]
//! trait. [`ArmClient`] implements it over the resource manager REST API;
//! tests substitute mocks.

pub mod arm;
pub mod client;
pub mod config;
pub mod pager;
pub mod types;

pub use arm::ArmClient;
pub use client::CloudClient;
pub use config::{CloudConfig, CloudEndpoints, DEFAULT_ARM_OPERATION_TIMEOUT};
pub use pager::{Page, PageSource, Pager};
pub use types::{
    AppCredentials, DeploymentResult, Location, OsDisk, ResourceSku, RoleAssignment, ScaleSet,
    ScaleSetVm, VirtualMachine, PROVISIONING_FAILED,
};
