pub mod artifacts;
pub mod ensemble;
pub mod features;
pub mod loader;
