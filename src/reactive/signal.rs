use super::{AsSubscribers, Subscribers, Subscription, unsubscribe_on_drop};
use std::rc::Rc;

struct SignalInner<T> {
    subscribers: Subscribers<T>,
}

impl<T> AsSubscribers<T> for SignalInner<T> {
    fn subscribers(&self) -> &Subscribers<T> {
        &self.subscribers
    }
}

/// A stream of discrete events, such as a monitor being attached.
///
/// Unlike a live value a signal has no current value and never skips an
/// emission: every `emit` reaches every connected callback, in order.
pub struct Signal<T>(Rc<SignalInner<T>>);

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self(Rc::new(SignalInner {
            subscribers: Subscribers::default(),
        }))
    }
}

impl<T: 'static> Signal<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: &T) {
        self.0.subscribers.notify(event);
    }

    pub fn connect(&self, f: impl Fn(&T) + 'static) -> Subscription {
        let id = self.0.subscribers.add(Rc::new(f));

        unsubscribe_on_drop(Rc::downgrade(&self.0), id)
    }

    pub fn connection_count(&self) -> usize {
        self.0.subscribers.len()
    }
}
