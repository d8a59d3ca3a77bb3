#![forbid(unsafe_code)]

pub mod api;
pub mod health;
pub mod watchlist;
