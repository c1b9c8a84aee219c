mod auth;
mod charts;
mod helpers;
mod mocks;
mod orders;
mod webhooks;
