//! Delivery side of Herald: channels, the delivery worker, the queue consumer
//! and the stuck-delivery sweep.

pub mod channel;
pub mod consumer;
pub mod sweep;
pub mod worker;
