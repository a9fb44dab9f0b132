// src/matching/mod.rs
pub mod cascade;
pub mod collision;
pub mod fuzzy;
pub mod index;
pub mod manager;
pub mod name;
pub mod probabilistic;
