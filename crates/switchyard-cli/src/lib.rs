//! Switchyard CLI library
//!
//! Command-line front end over the broker manager

pub mod commands;
