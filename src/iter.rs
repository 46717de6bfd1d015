//! Pull-based cursor plumbing shared by the generator and the builder.
//!
//! Every stream in this crate is an `Iterator<Item = Result<T>>`: `next()` is the
//! explicit "advance" step, `None` means exhausted, `Some(Err(_))` is fatal.

use crate::error::{BloomError, Result};
use crate::types::{Fingerprint, Series, SeriesWithBloom};

/// Anything ordered by series fingerprint.
pub trait Fingerprinted {
    fn fingerprint(&self) -> Fingerprint;
}

impl Fingerprinted for Series {
    #[inline]
    fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }
}

impl Fingerprinted for SeriesWithBloom {
    #[inline]
    fn fingerprint(&self) -> Fingerprint {
        self.series.fingerprint
    }
}

/// Enforces strictly ascending fingerprints on a stream.
///
/// A repeated or decreasing fingerprint yields [`BloomError::OrderingViolation`];
/// after the first error the cursor is exhausted.
pub struct CheckedOrder<I> {
    inner: I,
    stream: &'static str,
    last: Option<Fingerprint>,
    failed: bool,
}

impl<I> CheckedOrder<I> {
    pub fn new(inner: I, stream: &'static str) -> Self {
        Self {
            inner,
            stream,
            last: None,
            failed: false,
        }
    }

    /// Fingerprint of the last item handed out.
    pub fn last_fingerprint(&self) -> Option<Fingerprint> {
        self.last
    }

    pub(crate) fn inner(&self) -> &I {
        &self.inner
    }
}

impl<I, T> Iterator for CheckedOrder<I>
where
    I: Iterator<Item = Result<T>>,
    T: Fingerprinted,
{
    type Item = Result<T>;

    fn next(&mut self) -> Option<Result<T>> {
        if self.failed {
            return None;
        }
        let item = match self.inner.next()? {
            Ok(item) => item,
            Err(e) => {
                self.failed = true;
                return Some(Err(e));
            }
        };
        let fp = item.fingerprint();
        if let Some(previous) = self.last {
            if fp <= previous {
                self.failed = true;
                return Some(Err(BloomError::OrderingViolation {
                    stream: self.stream,
                    previous,
                    current: fp,
                }));
            }
        }
        self.last = Some(fp);
        Some(Ok(item))
    }
}
