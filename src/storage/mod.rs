pub mod models;
pub mod store;

pub use models::{StoredAlertEvent, StoredSample};
pub use store::SampleStore;
