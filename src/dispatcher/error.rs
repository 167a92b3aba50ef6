use thiserror::Error;

/// Error returned by [`DispatcherHandle::submit`](super::DispatcherHandle::submit).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("dispatcher is shut down")]
    ChannelClosed,

    #[error("order {0} is already being reconciled")]
    AlreadyInFlight(String),
}
