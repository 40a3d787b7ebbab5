//! Shared HTTP client construction.

use reqwest::Client;

use crate::CURRENT_VERSION;
use crate::config::NetworkConfig;
use crate::error::UpdateResult;

/// Build the HTTP client used for manifest and payload requests.
///
/// Only the connect timeout is set here; request and per-chunk timeouts are
/// applied by each operation.
pub fn build_http_client(network: &NetworkConfig) -> UpdateResult<Client> {
    let client = Client::builder()
        .connect_timeout(network.connect_timeout())
        .user_agent(format!("layer-updater/{}", CURRENT_VERSION))
        .build()?;
    Ok(client)
}
