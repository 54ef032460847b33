/// HiEasy DVR bridge: speaks the DVR's XML-over-TCP protocol and
/// re-publishes its H.264 feeds through a local mediamtx instance.
pub mod auth;
pub mod config;
pub mod error;
pub mod protocol;
pub mod services;
pub mod web;
