pub mod classes;
pub mod core;
pub mod imports;
pub mod setup;
