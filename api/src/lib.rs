//! Web services for handing out survey tasks and their response URLs.

#[macro_use]
extern crate rocket;

pub mod assignment;
pub mod helpers;
pub mod urls;
