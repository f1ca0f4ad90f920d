use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::topic::{Sample, Topic};
use super::types::CallbackResult;

/// Number of points a chart keeps when the caller does not pick a capacity.
pub const DEFAULT_WINDOW_CAPACITY: usize = 20;

/// Fixed-capacity sliding window of the most recent items.
///
/// This is a small wrapper around `VecDeque`:
/// - `push` is O(1) and evicts from the front when full.
/// - Iteration order is arrival order, oldest first.
/// - Memory usage is bounded by `capacity`.
#[derive(Debug, Clone, PartialEq)]
pub struct Window<T> {
    buffer: VecDeque<T>,
    capacity: usize,
}

impl<T> Window<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append `item`, returning the evicted oldest item when the window was full.
    pub fn push(&mut self, item: T) -> Option<T> {
        // Capacity==0 means "store nothing". Without this guard, VecDeque could grow unbounded.
        if self.capacity == 0 {
            return Some(item);
        }

        let evicted = if self.buffer.len() == self.capacity {
            self.buffer.pop_front()
        } else {
            None
        };
        self.buffer.push_back(item);
        evicted
    }

    /// Seed the window with historical items, oldest first. Same eviction rule as `push`.
    pub fn backfill<I>(&mut self, items: I)
    where
        I: IntoIterator<Item = T>,
    {
        for item in items {
            self.push(item);
        }
    }

    pub fn latest(&self) -> Option<&T> {
        self.buffer.back()
    }

    pub fn oldest(&self) -> Option<&T> {
        self.buffer.front()
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.buffer.get(index)
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.buffer.iter()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.buffer.len() == self.capacity
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Owned copy of the current contents, oldest first.
    pub fn snapshot(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.buffer.iter().cloned().collect()
    }
}

impl<T> Default for Window<T> {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_CAPACITY)
    }
}

impl<'a, T> IntoIterator for &'a Window<T> {
    type Item = &'a T;
    type IntoIter = std::collections::vec_deque::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.buffer.iter()
    }
}

impl<T> IntoIterator for Window<T> {
    type Item = T;
    type IntoIter = std::collections::vec_deque::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.buffer.into_iter()
    }
}

/// Identifies one chart series: a topic plus the metric drawn from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    pub topic: Topic,
    pub series: String,
}

impl WindowKey {
    pub fn new(topic: impl Into<Topic>, series: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            series: series.into(),
        }
    }

    /// Key for a window holding whole samples of a topic.
    pub fn topic(topic: impl Into<Topic>) -> Self {
        Self::new(topic, "")
    }
}

/// Set of windows keyed by `(topic, series)`, created lazily on first push.
#[derive(Debug, Clone)]
pub struct SlidingWindowAggregator<T> {
    windows: HashMap<WindowKey, Window<T>>,
    default_capacity: usize,
}

impl<T> SlidingWindowAggregator<T> {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            windows: HashMap::new(),
            default_capacity,
        }
    }

    pub fn default_capacity(&self) -> usize {
        self.default_capacity
    }

    /// Return the window for `key`, creating it with `capacity` if absent.
    ///
    /// An existing window keeps its original capacity.
    pub fn ensure_window(&mut self, key: WindowKey, capacity: usize) -> &mut Window<T> {
        self.windows
            .entry(key)
            .or_insert_with(|| Window::new(capacity))
    }

    pub fn push(&mut self, key: WindowKey, item: T) -> Option<T> {
        let capacity = self.default_capacity;
        match self.windows.entry(key) {
            Entry::Occupied(mut entry) => entry.get_mut().push(item),
            Entry::Vacant(entry) => entry.insert(Window::new(capacity)).push(item),
        }
    }

    pub fn backfill<I>(&mut self, key: WindowKey, items: I)
    where
        I: IntoIterator<Item = T>,
    {
        let capacity = self.default_capacity;
        self.ensure_window(key, capacity).backfill(items);
    }

    pub fn window(&self, key: &WindowKey) -> Option<&Window<T>> {
        self.windows.get(key)
    }

    /// Copy of the window for `key`; empty when nothing has been pushed yet.
    pub fn snapshot(&self, key: &WindowKey) -> Vec<T>
    where
        T: Clone,
    {
        self.windows
            .get(key)
            .map(Window::snapshot)
            .unwrap_or_default()
    }

    pub fn remove(&mut self, key: &WindowKey) -> Option<Window<T>> {
        self.windows.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &WindowKey> {
        self.windows.keys()
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

impl<T> Default for SlidingWindowAggregator<T> {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_CAPACITY)
    }
}

/// Cloneable shared handle so a subscription callback can push while a view snapshots.
#[derive(Debug)]
pub struct WindowHandle<T> {
    inner: Arc<Mutex<SlidingWindowAggregator<T>>>,
}

impl<T> Clone for WindowHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> WindowHandle<T> {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SlidingWindowAggregator::new(default_capacity))),
        }
    }

    // A panicking writer cannot leave a window half-pushed, so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, SlidingWindowAggregator<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, key: WindowKey, item: T) -> Option<T> {
        self.lock().push(key, item)
    }

    pub fn backfill<I>(&self, key: WindowKey, items: I)
    where
        I: IntoIterator<Item = T>,
    {
        self.lock().backfill(key, items);
    }

    pub fn ensure_window(&self, key: WindowKey, capacity: usize) {
        self.lock().ensure_window(key, capacity);
    }

    pub fn snapshot(&self, key: &WindowKey) -> Vec<T>
    where
        T: Clone,
    {
        self.lock().snapshot(key)
    }

    pub fn remove(&self, key: &WindowKey) -> Option<Window<T>> {
        self.lock().remove(key)
    }

    /// Run `f` against the aggregator under the lock.
    pub fn with<R>(&self, f: impl FnOnce(&mut SlidingWindowAggregator<T>) -> R) -> R {
        f(&mut self.lock())
    }
}

impl<T> Default for WindowHandle<T> {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_CAPACITY)
    }
}

/// One chart point extracted from a sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeriesPoint {
    pub timestamp_ms: i64,
    pub value: f64,
}

/// Subscription callback that keeps whole samples under `WindowKey::topic(sample topic)`.
pub fn sample_feeder(
    handle: WindowHandle<Sample>,
) -> impl FnMut(&Sample) -> CallbackResult + Send + 'static {
    move |sample: &Sample| {
        handle.push(WindowKey::topic(sample.topic().clone()), sample.clone());
        Ok(())
    }
}

/// Subscription callback that pushes one point per numeric field into `(topic, field)` windows.
///
/// Fields missing from a sample, or not numeric, are skipped for that sample.
pub fn series_feeder<I, S>(
    handle: WindowHandle<SeriesPoint>,
    fields: I,
) -> impl FnMut(&Sample) -> CallbackResult + Send + 'static
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let fields: Vec<String> = fields.into_iter().map(Into::into).collect();
    move |sample: &Sample| {
        handle.with(|agg| {
            for field in &fields {
                if let Some(value) = sample.field_f64(field) {
                    agg.push(
                        WindowKey::new(sample.topic().clone(), field.as_str()),
                        SeriesPoint {
                            timestamp_ms: sample.timestamp_ms(),
                            value,
                        },
                    );
                }
            }
        });
        Ok(())
    }
}
