// src/handlers/mod.rs
pub mod git_http;
