// src/storage/mod.rs
pub mod git;
pub mod meta;
