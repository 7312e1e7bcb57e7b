pub mod batch;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod lifecycle;
pub mod render;
pub mod schedule;
pub mod storage;
pub mod web;
