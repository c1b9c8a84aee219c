//! # Membership payment gateway server
//! This crate hosts the HTTP front end of the membership payment gateway. It is responsible for:
//! * Letting signed-in users create membership orders and list their own orders.
//! * Starting payments with Alipay (checkout page) and WeChat Pay (QR code), and polling them for the result.
//! * Receiving the providers' signed payment notifications and settling the matching orders.
//! * Serving the admin dashboard's monthly charts, both on request and as a Server-Sent Events feed.
//! * Running the daily sweep that cancels unpaid orders, and the consumer of the expired-orders queue.
//!
//! ## Configuration
//! The server is configured via environment variables. See [config](config/index.html) for more information.
//!
//! ## Routes
//! See [routes](routes/index.html). `/health` returns a 200 OK response and needs no authentication.

pub mod auth;
pub mod broadcast;
pub mod cli;
pub mod config;
pub mod data_objects;
pub mod errors;
pub mod expiry_worker;
pub mod helpers;
pub mod integrations;
pub mod middleware;
pub mod routes;
pub mod server;

#[cfg(test)]
mod endpoint_tests;
