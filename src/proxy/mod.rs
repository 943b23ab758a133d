pub mod cache;
pub mod capture;
pub mod connect;
pub mod dispatch;
pub mod http;
pub mod listener;
pub mod request;
pub mod server;
pub mod upstream;

use std::sync::Arc;

use crate::settings::Settings;
use crate::tls::issuer::TlsIssuer;
use self::cache::transport::Transport;

/// Everything a connection handler needs, cloned per task.
#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub tls: Arc<TlsContext>,
    pub caching: Arc<dyn Transport>,
    pub passthrough: Arc<dyn Transport>,
}

pub struct TlsContext {
    pub issuer: Arc<TlsIssuer>,
}
