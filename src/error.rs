use core::any::Any;
use std::sync::Arc;
use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

/// Error handed to every caller of a deduplicated unit of work.
///
/// All callers that shared one execution receive clones of the same value,
/// so a work error is the same `Arc` for the leader and every waiter.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The work returned an error.
    #[error("{0}")]
    Work(Arc<anyhow::Error>),

    /// The work panicked before returning.
    #[error("work panicked: {message}")]
    Panicked { message: Arc<str> },

    /// The leader of an async call was dropped before the work completed.
    #[error("leader dropped before work completed")]
    LeaderDropped,
}

impl Error {
    pub(crate) fn work<E: Into<anyhow::Error>>(err: E) -> Self {
        Error::Work(Arc::new(err.into()))
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message: Arc<str> = if let Some(s) = payload.downcast_ref::<&'static str>() {
            Arc::from(*s)
        } else if let Some(s) = payload.downcast_ref::<String>() {
            Arc::from(s.as_str())
        } else {
            Arc::from("opaque panic payload")
        };
        Error::Panicked { message }
    }

    /// The error returned by the work, if that is what failed.
    pub fn work_error(&self) -> Option<&anyhow::Error> {
        match self {
            Error::Work(err) => Some(&**err),
            _ => None,
        }
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, Error::Panicked { .. })
    }
}
