//! Process-wide client.
//!
//! Single-writer rule: the first [`set_query_client`] wins and later calls
//! are refused. [`get_query_client`] installs a default client when nothing
//! has been set yet, which also counts as the first write. Use
//! [`replace_query_client`] to swap the client deliberately.

use crate::client::QueryClient;
use crate::sync;
use once_cell::sync::Lazy;
use std::sync::RwLock;

static GLOBAL_CLIENT: Lazy<RwLock<Option<QueryClient>>> = Lazy::new(|| RwLock::new(None));

/// The global client, installing a default one on first use.
pub fn get_query_client() -> QueryClient {
    if let Some(client) = sync::read(&GLOBAL_CLIENT, "global client").as_ref() {
        return client.clone();
    }

    let mut slot = sync::write(&GLOBAL_CLIENT, "global client");
    slot.get_or_insert_with(|| {
        tracing::debug!("Installing default global query client");
        QueryClient::new()
    })
    .clone()
}

/// Install `client` as the global client. Returns `false` and leaves the
/// existing client in place if one was already installed.
pub fn set_query_client(client: QueryClient) -> bool {
    let mut slot = sync::write(&GLOBAL_CLIENT, "global client");
    if slot.is_some() {
        tracing::warn!("Global query client already set, ignoring");
        return false;
    }
    *slot = Some(client);
    true
}

/// Install `client` unconditionally, returning the previous one.
pub fn replace_query_client(client: QueryClient) -> Option<QueryClient> {
    sync::write(&GLOBAL_CLIENT, "global client").replace(client)
}

pub fn has_query_client() -> bool {
    sync::read(&GLOBAL_CLIENT, "global client").is_some()
}

/// Remove the global client. The next [`get_query_client`] installs a fresh default.
pub fn take_query_client() -> Option<QueryClient> {
    sync::write(&GLOBAL_CLIENT, "global client").take()
}
