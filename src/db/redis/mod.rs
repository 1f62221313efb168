pub mod store;

pub use store::RedisStore;

use ::redis::Client;

/// Creates a Redis client for the document store
///
/// The store wraps it in a connection manager, which reconnects on failure
/// and multiplexes concurrent commands over one connection.
pub fn create_redis_client(redis_url: &str) -> anyhow::Result<Client> {
    let client = Client::open(redis_url)?;
    Ok(client)
}
