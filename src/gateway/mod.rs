//! HTTP front door: app, request pipeline, proxying and server lifecycle

pub mod logout;
pub mod pipeline;
pub mod proxy;
pub mod router;
pub mod server;
pub mod well_known;

pub use proxy::{ProxyDispatcher, ProxyError};
pub use router::{AppState, create_router};
pub use server::Gateway;
