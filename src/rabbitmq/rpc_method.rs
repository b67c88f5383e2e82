use serde::{de::DeserializeOwned, Serialize};

/// A typed RPC operation: the queue its server listens on and the shapes of its
/// request and response. Caller and callee agree on these out of band by sharing
/// the implementing type.
pub trait RpcMethod: Send + Sync + 'static {
    type Request: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// The type of response this method returns
    type Response: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// The work queue the server consumes requests from
    fn queue() -> &'static str;
}
