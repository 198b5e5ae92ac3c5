pub mod core;
pub mod exchange;
pub mod group;
pub mod roster;
