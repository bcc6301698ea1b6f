//! Herald HTTP API: the trigger endpoint plus the admin and user views over
//! templates, deliveries and rendered messages.

pub mod routes;
pub mod state;
