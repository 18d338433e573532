pub mod batch;
pub mod coordinator;
pub mod directory;
pub mod eta;
pub mod reporting;
pub mod routing;
pub mod tracker;
