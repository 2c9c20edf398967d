#[macro_use]
extern crate diesel;

#[macro_use]
extern crate diesel_migrations;

#[macro_use]
extern crate log;

pub mod artifacts;
pub mod auth;
pub mod cache;
pub mod config;
pub mod datasets;
pub mod db;
pub mod drive;
pub mod error;
pub mod labels;
pub mod matrix;
pub mod pb;
pub mod server;
pub mod table;
pub mod tiler;
pub mod usage_tracker;
