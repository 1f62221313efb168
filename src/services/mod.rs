pub mod preselection;
pub mod relations;

pub use preselection::PreselectionEngine;
pub use relations::RelationManager;
