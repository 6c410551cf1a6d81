//! CLI Commands

pub mod drivers;
pub mod run;
