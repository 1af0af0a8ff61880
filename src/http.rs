use once_cell::sync::Lazy;
use reqwest::Client;
use std::time::Duration;

// Shared HTTP client with reasonable defaults for timeouts
static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .user_agent(concat!("lyrisync/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(30))
        .build()
        .expect("failed to build HTTP client")
});

pub(crate) fn client() -> &'static Client {
    &HTTP_CLIENT
}
