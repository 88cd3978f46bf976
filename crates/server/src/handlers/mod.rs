//! HTTP request handlers

pub mod answer;
pub mod health;
