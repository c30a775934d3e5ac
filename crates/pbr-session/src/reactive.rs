//! Minimal observable cells.
//!
//! Watchers run synchronously inside the mutating call, in registration
//! order, once per effective change. Nothing is batched or coalesced.

use std::fmt;

pub type Watcher<T> = Box<dyn FnMut(&T) + Send>;

/// A value whose changes are observed.
pub struct Tracked<T> {
    value: T,
    watchers: Vec<Watcher<T>>,
}

impl<T: PartialEq> Tracked<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            watchers: Vec::new(),
        }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    /// Stores `value` and notifies watchers. Setting an equal value is not a
    /// change and notifies nobody.
    pub fn set(&mut self, value: T) -> bool {
        if self.value == value {
            return false;
        }
        self.value = value;
        for watcher in &mut self.watchers {
            watcher(&self.value);
        }
        true
    }

    pub fn watch(&mut self, watcher: impl FnMut(&T) + Send + 'static) {
        self.watchers.push(Box::new(watcher));
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.len()
    }

    /// Drops every watcher and returns how many there were.
    pub fn unwatch_all(&mut self) -> usize {
        let count = self.watchers.len();
        self.watchers.clear();
        count
    }
}

impl<T: fmt::Debug> fmt::Debug for Tracked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracked")
            .field("value", &self.value)
            .field("watchers", &self.watchers.len())
            .finish()
    }
}

pub enum ListChange<'a, T> {
    Pushed(&'a mut T),
    Removed(&'a T),
}

pub type ListWatcher<T> = Box<dyn FnMut(ListChange<'_, T>) + Send>;

/// An ordered sequence whose appends and removals are observed. Changes to
/// the elements themselves are the elements' business.
pub struct TrackedList<T> {
    items: Vec<T>,
    watchers: Vec<ListWatcher<T>>,
}

impl<T> TrackedList<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items,
            watchers: Vec::new(),
        }
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.items.iter_mut()
    }

    pub fn find_mut(&mut self, mut predicate: impl FnMut(&T) -> bool) -> Option<&mut T> {
        self.items.iter_mut().find(|item| predicate(item))
    }

    pub fn push(&mut self, item: T) {
        self.items.push(item);
        let last = self.items.len() - 1;
        for watcher in &mut self.watchers {
            watcher(ListChange::Pushed(&mut self.items[last]));
        }
    }

    pub fn remove_where(&mut self, mut predicate: impl FnMut(&T) -> bool) -> Option<T> {
        let index = self.items.iter().position(|item| predicate(item))?;
        let removed = self.items.remove(index);
        for watcher in &mut self.watchers {
            watcher(ListChange::Removed(&removed));
        }
        Some(removed)
    }

    pub fn watch(&mut self, watcher: impl FnMut(ListChange<'_, T>) + Send + 'static) {
        self.watchers.push(Box::new(watcher));
    }

    pub fn unwatch_all(&mut self) -> usize {
        let count = self.watchers.len();
        self.watchers.clear();
        count
    }
}

impl<T: fmt::Debug> fmt::Debug for TrackedList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedList")
            .field("items", &self.items)
            .field("watchers", &self.watchers.len())
            .finish()
    }
}
