pub mod catalog;
pub mod core;
pub mod registrations;
pub mod results;
pub mod setup;
pub mod templates;
