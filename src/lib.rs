use shadow_rs::shadow;

shadow!(build);

pub mod cache;
pub mod cli;
pub mod config;
pub mod export;
pub mod harvest;
pub mod models;
pub mod run;
pub mod search;
pub mod store;
