//! Per-thread record of keys currently under construction.
//!
//! Factories run synchronously, so the frames pushed while a key is being
//! built describe exactly the path that led to it. A key that shows up twice
//! for the same locator is a cycle; reporting it beats deadlocking on the
//! cache cell or overflowing the stack on a transient.

use std::cell::RefCell;

use crate::error::{CircularDependencyError, Result, SiyaqError};
use crate::key::KeyMeta;

struct Frame {
    locator: u64,
    key: KeyMeta,
}

thread_local! {
    static IN_FLIGHT: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

/// Fails if `key` is already being built by `locator` on this thread.
pub(crate) fn check(locator: u64, key: &KeyMeta) -> Result<()> {
    IN_FLIGHT.with(|frames| {
        let frames = frames.borrow();
        match frames.iter().position(|f| f.locator == locator && f.key == *key) {
            Some(start) => {
                let mut chain: Vec<KeyMeta> = frames[start..].iter().map(|f| f.key.clone()).collect();
                chain.push(key.clone());
                Err(SiyaqError::CircularDependency(CircularDependencyError { chain }))
            }
            None => Ok(()),
        }
    })
}

/// Marks `key` as under construction until the guard drops.
pub(crate) fn enter(locator: u64, key: &KeyMeta) -> Result<BuildGuard> {
    check(locator, key)?;
    IN_FLIGHT.with(|frames| {
        frames.borrow_mut().push(Frame {
            locator,
            key: key.clone(),
        })
    });
    Ok(BuildGuard { _private: () })
}

pub(crate) struct BuildGuard {
    _private: (),
}

impl Drop for BuildGuard {
    fn drop(&mut self) {
        IN_FLIGHT.with(|frames| {
            frames.borrow_mut().pop();
        });
    }
}
