//! Client-side state owned by the coordinator.

pub mod history;

pub use history::MessageHistory;
