use std::sync::OnceLock;
use std::time::Duration;

use tracing::debug;

use crate::{Error, Result};

const USER_AGENT: &str = concat!("vidpipe/", env!("CARGO_PKG_VERSION"));

/// Install the process-wide rustls crypto provider once.
///
/// reqwest is built without a bundled provider, so this must run before the
/// first client is created.
pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Build the client used for HTTP fetches. A zero timeout disables the
/// whole-request timeout; connects are always bounded.
pub fn build_http_client(request_timeout: Duration) -> Result<reqwest::Client> {
    install_rustls_provider();

    let mut builder = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(Duration::from_secs(10))
        .tcp_nodelay(true);
    if !request_timeout.is_zero() {
        builder = builder.timeout(request_timeout);
    }
    builder
        .build()
        .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))
}
