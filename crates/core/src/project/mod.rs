//! Project descriptors and the on-disk layout handed to collaborators.

mod layout;
mod temporal;
mod types;

pub(crate) use layout::date_dir;
pub use layout::ProjectLayout;
pub use temporal::CompositionStrategy;
pub use types::{DateRange, ProjectDescriptor, ProjectError, ProjectPlugin, SummaryDefinition};
