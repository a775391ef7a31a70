pub mod aggregate;
pub mod crawler;
pub mod worker;

pub use worker::{Harvester, HarvesterHandle};
