pub mod defs;
pub mod capability;
