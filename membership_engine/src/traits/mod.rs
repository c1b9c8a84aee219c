//! #  Database management and control.
//!
//! This module provides the interfaces that define the interface contracts of the membership engine database
//! *backends*.
//!
//! * [`PaymentGatewayDatabase`] defines the order state machine: creation, settlement and expiry. These are the only
//!   operations that mutate orders, and they are all transactional.
//! * [`AccountManagement`] provides read-only queries over users, orders and the monthly statistics.
//! * [`ExpiryPublisher`] is the hook through which the expiry sweep announces the orders it is about to cancel.
mod account_management;
mod data_objects;
mod expiry_publisher;
mod payment_gateway_database;

pub use account_management::{AccountApiError, AccountManagement};
pub use data_objects::{OrderPage, OrderQueryFilter, Pagination, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
pub use expiry_publisher::ExpiryPublisher;
pub use payment_gateway_database::{PaymentGatewayDatabase, PaymentGatewayError};
