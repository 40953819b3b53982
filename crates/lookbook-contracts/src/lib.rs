pub mod aspect;
pub mod catalog;
pub mod commands;
pub mod events;
pub mod identity;
pub mod ledger;
pub mod models;
pub mod runs;
