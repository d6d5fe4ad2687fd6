//! HTTP/JSON gateway and Prometheus exposition.

mod gateway;

pub use gateway::{HttpGateway, HttpGatewayHandle};
