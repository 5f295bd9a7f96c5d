//! Live values with change notification.
//!
//! A [`Live`] owns a current value and a list of subscriber callbacks. Only the
//! owner of the `Live` can write; everybody else gets an [`Accessor`], which can
//! read, subscribe and derive new accessors with [`Accessor::map`],
//! [`Accessor::combine`] or [`combine_all`].
//!
//! Every subscription is a [`Subscription`] guard. Guards are collected into a
//! [`Scope`] and released together when the scope is disposed or dropped.

use std::{
    cell::{Cell, RefCell},
    rc::{Rc, Weak},
};

mod signal;
mod tick;

pub use signal::*;
pub use tick::*;

type Callback<T> = Rc<dyn Fn(&T)>;

struct Subscribers<T> {
    next_id: Cell<u64>,
    entries: RefCell<Vec<(u64, Callback<T>)>>,
}

impl<T> Default for Subscribers<T> {
    fn default() -> Self {
        Self {
            next_id: Cell::new(1),
            entries: RefCell::new(Vec::new()),
        }
    }
}

impl<T> Subscribers<T> {
    fn add(&self, callback: Callback<T>) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.entries.borrow_mut().push((id, callback));

        id
    }

    fn remove(&self, id: u64) -> bool {
        let mut entries = self.entries.borrow_mut();
        let len = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);

        entries.len() < len
    }

    // The list is cloned before calling out so a callback may subscribe or
    // unsubscribe without hitting a borrow conflict.
    fn notify(&self, value: &T) {
        let callbacks = self
            .entries
            .borrow()
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect::<Vec<_>>();

        for callback in callbacks {
            callback(value);
        }
    }

    fn len(&self) -> usize {
        self.entries.borrow().len()
    }
}

fn unsubscribe_on_drop<T, S>(subscribers: Weak<S>, id: u64) -> Subscription
where
    T: 'static,
    S: AsSubscribers<T> + 'static,
{
    Subscription::new(move || {
        if let Some(subscribers) = subscribers.upgrade() {
            subscribers.subscribers().remove(id);
        }
    })
}

trait AsSubscribers<T> {
    fn subscribers(&self) -> &Subscribers<T>;
}

struct LiveInner<T> {
    value: RefCell<T>,
    subscribers: Subscribers<T>,
}

impl<T> AsSubscribers<T> for LiveInner<T> {
    fn subscribers(&self) -> &Subscribers<T> {
        &self.subscribers
    }
}

/// The writable side of a live value. Not `Clone`: there is one writer.
pub struct Live<T>(Rc<LiveInner<T>>);

impl<T: Clone + PartialEq + 'static> Live<T> {
    pub fn new(value: T) -> Self {
        Self(Rc::new(LiveInner {
            value: RefCell::new(value),
            subscribers: Subscribers::default(),
        }))
    }

    /// Replaces the current value and notifies subscribers once.
    ///
    /// Returns `false` without notifying anyone when `value` equals the
    /// current value.
    pub fn set(&self, value: T) -> bool {
        {
            let mut current = self.0.value.borrow_mut();
            if *current == value {
                return false;
            }
            *current = value.clone();
        }

        self.0.subscribers.notify(&value);

        true
    }

    pub fn accessor(&self) -> Accessor<T> {
        Accessor(self.0.clone())
    }
}

/// Read-only handle on a [`Live`] value.
pub struct Accessor<T>(Rc<LiveInner<T>>);

impl<T> Clone for Accessor<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Accessor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Accessor").field(&self.0.value.borrow()).finish()
    }
}

impl<T: Clone + PartialEq + 'static> Accessor<T> {
    /// A constant accessor, useful as a placeholder source.
    pub fn constant(value: T) -> Self {
        Live::new(value).accessor()
    }

    pub fn get(&self) -> T {
        self.0.value.borrow().clone()
    }

    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.0.value.borrow())
    }

    /// Calls `f` on every change. The callback is not invoked with the
    /// current value; read it with [`Accessor::get`] if needed.
    pub fn subscribe(&self, f: impl Fn(&T) + 'static) -> Subscription {
        let id = self.0.subscribers.add(Rc::new(f));

        unsubscribe_on_drop(Rc::downgrade(&self.0), id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.0.subscribers.len()
    }

    /// Derives `f(value)`, re-evaluated on every change of `self`.
    ///
    /// The upstream subscription is registered in `scope`; once the scope is
    /// disposed the derived accessor keeps its last value and stops updating.
    pub fn map<U, F>(&self, scope: &mut Scope, f: F) -> Accessor<U>
    where
        U: Clone + PartialEq + 'static,
        F: Fn(&T) -> U + 'static,
    {
        let derived = self.with(|value| Live::new(f(value)));
        let target = Rc::downgrade(&derived.0);

        scope.add(self.subscribe(move |value| {
            if let Some(target) = target.upgrade() {
                Live(target).set(f(value));
            }
        }));

        derived.accessor()
    }

    /// Derives `f(a, b)` from two sources, re-evaluated when either changes.
    pub fn combine<U, V, F>(&self, other: &Accessor<U>, scope: &mut Scope, f: F) -> Accessor<V>
    where
        U: Clone + PartialEq + 'static,
        V: Clone + PartialEq + 'static,
        F: Fn(&T, &U) -> V + 'static,
    {
        let derived = Live::new(f(&self.get(), &other.get()));
        let target = Rc::downgrade(&derived.0);
        let left = Rc::downgrade(&self.0);
        let right = Rc::downgrade(&other.0);
        let recompute = Rc::new(move || {
            let (Some(target), Some(left), Some(right)) =
                (target.upgrade(), left.upgrade(), right.upgrade())
            else {
                return;
            };
            let value = f(&left.value.borrow(), &right.value.borrow());
            Live(target).set(value);
        });

        scope.add(self.subscribe({
            let recompute = recompute.clone();
            move |_| recompute()
        }));
        scope.add(other.subscribe(move |_| recompute()));

        derived.accessor()
    }
}

/// Derives `f(values)` from any number of same-typed sources.
pub fn combine_all<T, U, F>(sources: &[Accessor<T>], scope: &mut Scope, f: F) -> Accessor<U>
where
    T: Clone + PartialEq + 'static,
    U: Clone + PartialEq + 'static,
    F: Fn(&[T]) -> U + 'static,
{
    let current = sources.iter().map(Accessor::get).collect::<Vec<_>>();
    let derived = Live::new(f(&current));
    let target = Rc::downgrade(&derived.0);
    let upstream = sources
        .iter()
        .map(|source| Rc::downgrade(&source.0))
        .collect::<Vec<_>>();

    let recompute = Rc::new(move || {
        let Some(target) = target.upgrade() else {
            return;
        };
        let Some(values) = upstream
            .iter()
            .map(|source| source.upgrade().map(|source| source.value.borrow().clone()))
            .collect::<Option<Vec<_>>>()
        else {
            return;
        };
        Live(target).set(f(&values));
    });

    for source in sources {
        let recompute = recompute.clone();
        scope.add(source.subscribe(move |_| recompute()));
    }

    derived.accessor()
}

/// Guard for one registered callback. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes it immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce()>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn cancel(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// A disposal scope: every subscription created while building something.
#[derive(Default, Debug)]
pub struct Scope {
    subscriptions: Vec<Subscription>,
    disposed: bool,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `subscription`. A scope that was already disposed releases it
    /// right away.
    pub fn add(&mut self, subscription: Subscription) {
        if self.disposed {
            subscription.cancel();
        } else {
            self.subscriptions.push(subscription);
        }
    }

    pub fn consume(&mut self, other: &mut Scope) {
        for subscription in other.subscriptions.drain(..) {
            self.add(subscription);
        }
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Releases every recorded subscription. Idempotent: returns how many
    /// subscriptions this call released.
    pub fn dispose(&mut self) -> usize {
        self.disposed = true;
        let released = self.subscriptions.len();
        for subscription in self.subscriptions.drain(..).rev() {
            subscription.cancel();
        }

        released
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter() -> (Rc<Cell<usize>>, impl Fn(&i32) + 'static) {
        let count = Rc::new(Cell::new(0));
        let callback = {
            let count = count.clone();
            move |_: &i32| count.set(count.get() + 1)
        };

        (count, callback)
    }

    #[test]
    fn equal_value_does_not_notify() {
        let live = Live::new(3);
        let (count, callback) = counter();
        let _sub = live.accessor().subscribe(callback);

        assert!(!live.set(3));
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn changed_value_notifies_each_subscriber_once_with_new_value() {
        let live = Live::new(1);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let accessor = live.accessor();

        let _a = accessor.subscribe({
            let seen = seen.clone();
            let accessor = accessor.clone();
            move |value| seen.borrow_mut().push(("a", *value, accessor.get()))
        });
        let _b = accessor.subscribe({
            let seen = seen.clone();
            move |value| seen.borrow_mut().push(("b", *value, *value))
        });

        assert!(live.set(2));
        assert_eq!(*seen.borrow(), vec![("a", 2, 2), ("b", 2, 2)]);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let live = Live::new(0);
        let (count, callback) = counter();
        let sub = live.accessor().subscribe(callback);
        assert_eq!(live.accessor().subscriber_count(), 1);

        drop(sub);
        live.set(1);

        assert_eq!(count.get(), 0);
        assert_eq!(live.accessor().subscriber_count(), 0);
    }

    #[test]
    fn map_follows_source_until_scope_is_disposed() {
        let live = Live::new(2);
        let mut scope = Scope::new();
        let doubled = live.accessor().map(&mut scope, |v| v * 2);
        assert_eq!(doubled.get(), 4);

        live.set(5);
        assert_eq!(doubled.get(), 10);

        assert_eq!(scope.dispose(), 1);
        assert_eq!(live.accessor().subscriber_count(), 0);

        live.set(7);
        assert_eq!(doubled.get(), 10);
    }

    #[test]
    fn map_skips_notification_when_result_is_unchanged() {
        let live = Live::new(1);
        let mut scope = Scope::new();
        let is_odd = live.accessor().map(&mut scope, |v| v % 2 == 1);
        let hits = Rc::new(Cell::new(0));
        let _sub = is_odd.subscribe({
            let hits = hits.clone();
            move |_| hits.set(hits.get() + 1)
        });

        live.set(3);
        assert_eq!(hits.get(), 0);

        live.set(4);
        assert_eq!(hits.get(), 1);
        assert!(!is_odd.get());
    }

    #[test]
    fn dropped_derived_accessor_leaves_a_harmless_subscription() {
        let live = Live::new(1);
        let mut scope = Scope::new();
        drop(live.accessor().map(&mut scope, |v| v + 1));

        assert!(live.set(2));
        assert_eq!(scope.dispose(), 1);
    }

    #[test]
    fn combine_recomputes_on_either_source() {
        let a = Live::new(1);
        let b = Live::new(false);
        let mut scope = Scope::new();
        let shown = a
            .accessor()
            .combine(&b.accessor(), &mut scope, |count, enabled| *enabled && *count > 0);
        assert!(!shown.get());

        b.set(true);
        assert!(shown.get());

        a.set(0);
        assert!(!shown.get());

        assert_eq!(scope.len(), 2);
        scope.dispose();
        assert_eq!(a.accessor().subscriber_count(), 0);
        assert_eq!(b.accessor().subscriber_count(), 0);
    }

    #[test]
    fn combine_all_reads_consistent_values() {
        let sources = (0..3).map(Live::new).collect::<Vec<_>>();
        let accessors = sources.iter().map(Live::accessor).collect::<Vec<_>>();
        let mut scope = Scope::new();
        let sum = combine_all(&accessors, &mut scope, |values| values.iter().sum::<i32>());
        assert_eq!(sum.get(), 3);

        sources[2].set(10);
        assert_eq!(sum.get(), 11);
        assert_eq!(scope.len(), 3);
    }

    #[test]
    fn dispose_is_idempotent_and_later_adds_are_released() {
        let live = Live::new(0);
        let mut scope = Scope::new();
        scope.add(live.accessor().subscribe(|_| {}));

        assert_eq!(scope.dispose(), 1);
        assert_eq!(scope.dispose(), 0);
        assert!(scope.is_disposed());

        scope.add(live.accessor().subscribe(|_| {}));
        assert!(scope.is_empty());
        assert_eq!(live.accessor().subscriber_count(), 0);
    }

    #[test]
    fn callback_may_unsubscribe_itself() {
        let live = Live::new(0);
        let slot: Rc<RefCell<Option<Subscription>>> = Rc::default();
        let hits = Rc::new(Cell::new(0));
        let sub = live.accessor().subscribe({
            let slot = slot.clone();
            let hits = hits.clone();
            move |_| {
                hits.set(hits.get() + 1);
                slot.borrow_mut().take();
            }
        });
        *slot.borrow_mut() = Some(sub);

        live.set(1);
        live.set(2);

        assert_eq!(hits.get(), 1);
    }
}
