use std::time::Duration;

use reqwest::Client;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// One client per collaborator, so each carries its own overall timeout.
pub fn build_http_client(timeout: Duration) -> anyhow::Result<Client> {
    let client = Client::builder()
        .timeout(timeout)
        .connect_timeout(CONNECT_TIMEOUT.min(timeout))
        .build()?;
    Ok(client)
}
