use std::sync::Arc;

use crate::atomic::AtomicCounter;
use crate::core::TaskAttributes;
use crate::engine::queue::TaskQueue;
use crate::engine::tracking::{DependencyTracker, callback};
use crate::future::Future;

/// Something that can be cut in two and walked item by item.
pub trait Split: Sized + Send + 'static {
    type Item;
    type Iter: Iterator<Item = Self::Item>;

    fn size(&self) -> usize;

    /// Cuts off the second half. `self` keeps the first.
    fn split(&mut self) -> Self;

    fn items(self) -> Self::Iter;
}

macro_rules! impl_split {
    ($($T:ty),*) => {
        $(
            impl Split for std::ops::Range<$T> {
                type Item = $T;
                type Iter = std::ops::Range<$T>;

                fn size(&self) -> usize {
                    if self.end <= self.start {
                        return 0;
                    }
                    usize::try_from(self.end.abs_diff(self.start)).unwrap_or(usize::MAX)
                }

                fn split(&mut self) -> Self {
                    let half = self.end.abs_diff(self.start) / 2;
                    let mid = self.start + half as $T;
                    let right = mid..self.end;
                    self.end = mid;
                    right
                }

                fn items(self) -> Self::Iter {
                    self
                }
            }
        )*
    };
}

impl_split!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize);

impl<T> Split for Vec<T>
where
    T: Send + 'static,
{
    type Item = T;
    type Iter = std::vec::IntoIter<T>;

    fn size(&self) -> usize {
        self.len()
    }

    fn split(&mut self) -> Self {
        self.split_off(self.len() / 2)
    }

    fn items(self) -> Self::Iter {
        self.into_iter()
    }
}

/// A [`Split`] collection plus the size at which to stop splitting it.
#[derive(Debug, Clone)]
pub struct Range<S> {
    inner: S,
    chunksize: usize,
}

impl<S: Split> Range<S> {
    /// A range split all the way down to single items.
    pub fn new(inner: S) -> Self {
        Self::with_chunksize(inner, 1)
    }

    pub fn with_chunksize(inner: S, chunksize: usize) -> Self {
        Self {
            inner,
            chunksize: chunksize.max(1),
        }
    }

    /// A range that is never split.
    pub fn whole(inner: S) -> Self {
        let chunksize = inner.size();
        Self::with_chunksize(inner, chunksize)
    }

    pub fn size(&self) -> usize {
        self.inner.size()
    }

    pub fn chunksize(&self) -> usize {
        self.chunksize
    }

    /// Splits in half when larger than the chunk size.
    pub fn split(mut self) -> Result<(Self, Self), Self> {
        if self.inner.size() <= self.chunksize {
            return Err(self);
        }

        let right = self.inner.split();
        let chunksize = self.chunksize;
        Ok((
            self,
            Self {
                inner: right,
                chunksize,
            },
        ))
    }

    pub fn items(self) -> S::Iter {
        self.inner.items()
    }
}

struct ReduceOps<M, C> {
    map: M,
    combine: C,
}

fn reduce_range<S, R, M, C>(queue: TaskQueue, range: Range<S>, ops: Arc<ReduceOps<M, C>>) -> Future<R>
where
    S: Split,
    R: Clone + Default + Send + Sync + 'static,
    M: Fn(S::Item) -> R + Send + Sync + 'static,
    C: Fn(R, R) -> R + Send + Sync + 'static,
{
    let (left, right) = match range.split() {
        Ok(halves) => halves,
        Err(leaf) => {
            let sum = leaf
                .items()
                .fold(R::default(), |sum, item| (ops.combine)(sum, (ops.map)(item)));
            return Future::ready(sum);
        }
    };

    let spawn_half = |half: Range<S>| {
        let inner = queue.clone();
        let ops = ops.clone();
        queue.add_linked((), move |()| reduce_range(inner, half, ops))
    };

    let left = spawn_half(left);
    let right = spawn_half(right);
    queue.add((left, right), move |(left, right)| (ops.combine)(left, right))
}

struct ForEachRoot<O> {
    op: O,
    /// Starts at minus the number of items, every successful item adds one.
    status: AtomicCounter,
    /// One pending dependency per live split or leaf task.
    deps: DependencyTracker,
    result: Future<bool>,
}

impl<O> ForEachRoot<O> {
    fn finish(&self) {
        if !self.result.is_failed() {
            self.result.set(self.status.load() == 0);
        }
    }

    /// Stands in for a task that panicked before releasing its dependency.
    fn abandon(&self, failure: Arc<str>) {
        self.result.fail(failure);
        self.deps.dec();
    }
}

fn spawn_for_each<S, O>(queue: TaskQueue, range: Range<S>, root: Arc<ForEachRoot<O>>)
where
    S: Split,
    O: Fn(S::Item) -> bool + Send + Sync + 'static,
{
    let inner = queue.clone();
    let failed = root.clone();
    queue.spawn(
        TaskAttributes::hipri(),
        (),
        move |()| for_each_range(inner, range, root),
        move |failure| failed.abandon(failure),
    );
}

fn for_each_range<S, O>(queue: TaskQueue, range: Range<S>, root: Arc<ForEachRoot<O>>)
where
    S: Split,
    O: Fn(S::Item) -> bool + Send + Sync + 'static,
{
    match range.split() {
        Ok((left, right)) => {
            for half in [left, right] {
                root.deps.inc();
                spawn_for_each(queue.clone(), half, root.clone());
            }
        }
        Err(leaf) => {
            let done = leaf.items().map(|item| (root.op)(item)).filter(|ok| *ok).count();
            root.status.fetch_add(i64::try_from(done).unwrap_or(i64::MAX));
        }
    }

    root.deps.dec();
}

impl TaskQueue {
    /// Folds `combine(sum, map(item))` over every item of `range`, starting
    /// from `R::default()`, one task per chunk. Partial sums are combined in
    /// further tasks.
    ///
    /// For an associative and commutative `combine` with `R::default()` as
    /// its identity the result does not depend on the chunk size.
    pub fn reduce<S, R, M, C>(&self, range: Range<S>, map: M, combine: C) -> Future<R>
    where
        S: Split,
        R: Clone + Default + Send + Sync + 'static,
        M: Fn(S::Item) -> R + Send + Sync + 'static,
        C: Fn(R, R) -> R + Send + Sync + 'static,
    {
        reduce_range(self.clone(), range, Arc::new(ReduceOps { map, combine }))
    }

    /// Applies `op` to every item of `range`, one task per chunk. The result
    /// is `true` once every call has returned, if all of them returned
    /// `true`.
    pub fn for_each<S, O>(&self, range: Range<S>, op: O) -> Future<bool>
    where
        S: Split,
        O: Fn(S::Item) -> bool + Send + Sync + 'static,
    {
        let size = i64::try_from(range.size()).unwrap_or(i64::MAX);
        let result = Future::new();
        let root = Arc::new(ForEachRoot {
            op,
            status: AtomicCounter::new(-size),
            deps: DependencyTracker::new(1),
            result: result.clone(),
        });

        let done = root.clone();
        root.deps.register_callback(callback(move || done.finish()));
        spawn_for_each(self.clone(), range, root);

        result
    }
}
