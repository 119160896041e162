//! Fixed-size work partitions over an ordered record sequence.

use futures::stream::{Stream, TryChunksError, TryStreamExt};

/// Iterator adapter yielding consecutive, order-preserving partitions of at
/// most `size` items. The final partition carries the remainder.
#[derive(Debug, Clone)]
pub struct Partitioned<I> {
    inner: I,
    size: usize,
}

impl<I: Iterator> Iterator for Partitioned<I> {
    type Item = Vec<I::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        let partition: Vec<I::Item> = self.inner.by_ref().take(self.size).collect();
        if partition.is_empty() {
            None
        } else {
            Some(partition)
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let (lower, upper) = self.inner.size_hint();
        (
            lower.div_ceil(self.size),
            upper.map(|upper| upper.div_ceil(self.size)),
        )
    }
}

pub trait PartitionExt: Iterator + Sized {
    /// Split this iterator into partitions of `size` items. A size of zero is treated as one.
    fn partitioned(self, size: usize) -> Partitioned<Self> {
        Partitioned {
            inner: self,
            size: size.max(1),
        }
    }
}

impl<I: Iterator> PartitionExt for I {}

/// Split a fallible row stream into partitions of `size` rows, read lazily.
///
/// A read error is yielded in place of the partition it interrupted; rows read
/// before it in that partition are dropped.
pub fn partition_rows<S, T, E>(rows: S, size: usize) -> impl Stream<Item = Result<Vec<T>, E>>
where
    S: Stream<Item = Result<T, E>>,
{
    rows.try_chunks(size.max(1))
        .map_err(|TryChunksError(_, e)| e)
}
