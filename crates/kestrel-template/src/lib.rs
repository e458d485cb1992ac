//! ARM templates for the kestrel cluster engine
//!
//! [`generator`] turns a defaulted API model into a deployment template and
//! its parameters. [`transform`] narrows that template to what a post-deploy
//! verb may touch: scaling must not recreate the virtual network, an upgrade
//! must reattach etcd disks rather than create empty ones, and so on.

pub mod error;
pub mod generator;
pub mod model;
pub mod params;
pub mod primitives;
pub mod transform;

pub use error::{Result, TransformError};
pub use generator::{ArmGenerator, GeneratedTemplate, TemplateGenerator};
pub use model::{Resource, ResourceType, Template};
pub use params::Parameters;
pub use transform::{transform, transform_all, TransformMode};
