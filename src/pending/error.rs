use crate::request_id::RequestId;

/// Indicates that a request could not be registered because its id is still pending.
#[derive(Debug, thiserror::Error)]
#[error("the request id ({request_id}) is already pending")]
pub struct RequestAlreadyPending {
    pub request_id: RequestId,
}
