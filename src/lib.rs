// src/lib.rs
pub mod clustering;
pub mod match_log;
pub mod matching;
pub mod models;
pub mod reference;
pub mod reporting;
pub mod sources;
pub mod utils;
