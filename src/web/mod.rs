//! HTTP surface: the throttle middleware and a small server around it.

mod layer;
mod response;
mod server;

pub use layer::{ThrottleLayer, ThrottleService};
pub use response::{blocked_response, unavailable_response, BLOCKED_BODY, UNAVAILABLE_BODY};
pub use server::HttpServer;
