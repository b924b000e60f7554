pub mod object_store;
pub mod observer;

pub use object_store::{Filter, ObjectStore, UpsertOptions};
pub use observer::{ChangeLog, ChangeObserver, ChangeRecord};
