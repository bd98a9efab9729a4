#![recursion_limit = "256"]

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod inference;
pub mod metrics;
pub mod model;
pub mod scheduler;
pub mod tokenizer;
pub mod training;
