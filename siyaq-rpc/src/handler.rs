//! Pluggable classification of failed requests.
//!
//! Handlers are consulted most recently registered first; the first one
//! returning `Some` decides the response. Returning `None` passes the error
//! on to the next handler.

use std::error::Error as StdError;

use crate::error::Classification;

pub trait ErrorHandler: Send + Sync {
    fn classify(&self, error: &(dyn StdError + 'static)) -> Option<Classification>;
}

impl<F> ErrorHandler for F
where
    F: Fn(&(dyn StdError + 'static)) -> Option<Classification> + Send + Sync,
{
    fn classify(&self, error: &(dyn StdError + 'static)) -> Option<Classification> {
        self(error)
    }
}

/// Maps `std::io::ErrorKind::NotFound` anywhere in the chain to a 404.
///
/// Handy when services read files or blobs directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct IoNotFound;

impl ErrorHandler for IoNotFound {
    fn classify(&self, error: &(dyn StdError + 'static)) -> Option<Classification> {
        std::iter::successors(Some(error), |e| (*e).source())
            .filter_map(|e| e.downcast_ref::<std::io::Error>())
            .find(|e| e.kind() == std::io::ErrorKind::NotFound)
            .map(|_| Classification::new(404, "Not found"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closures_are_handlers() {
        let handler = |error: &(dyn StdError + 'static)| {
            error
                .to_string()
                .contains("timeout")
                .then(|| Classification::new(504, "Upstream timeout"))
        };

        let timeout = std::io::Error::other("read timeout");
        assert_eq!(handler.classify(&timeout).map(|c| c.code), Some(504));
        assert!(handler.classify(&std::io::Error::other("eof")).is_none());
    }

    #[test]
    fn io_not_found_matches_kind_only() {
        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "report.csv");
        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "report.csv");

        assert_eq!(IoNotFound.classify(&missing).map(|c| c.code), Some(404));
        assert!(IoNotFound.classify(&denied).is_none());
    }
}
