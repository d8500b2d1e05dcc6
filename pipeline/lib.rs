#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod cache;
pub mod config;
pub mod data;
pub mod parallel;
pub mod report;
pub mod run;
pub mod synthetic;

#[path = "../inference/mod.rs"]
pub mod inference;

#[path = "../selection/mod.rs"]
pub mod selection;

#[path = "../evaluate/mod.rs"]
pub mod evaluate;
