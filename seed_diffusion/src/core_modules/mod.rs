pub mod affinity;
pub mod class_selector;
pub mod constraint_system;
pub mod error;
pub mod grid;
pub mod neighborhood;
pub mod solver;
pub mod utils;
