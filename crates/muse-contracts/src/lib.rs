pub mod candidates;
pub mod events;
pub mod images;
pub mod store;
