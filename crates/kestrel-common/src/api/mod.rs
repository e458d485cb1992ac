//! API model: types, loading, defaulting, validation and `--set` overrides

pub mod defaults;
pub mod loader;
pub mod merge;
pub mod types;
pub mod validate;

pub use defaults::{apply_defaults, CertificateAction, DefaultsMode, DefaultsOutcome};
pub use loader::{ApiModelLoader, ApiVersion, JsonApiModelLoader, LoadOptions, LoadedModel};
pub use merge::{apply_set_flags, parse_overrides, Override};
pub use types::*;
pub use validate::validate;
