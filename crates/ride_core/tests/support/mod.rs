pub mod stores;
pub mod world;
