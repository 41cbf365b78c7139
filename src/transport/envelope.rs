//! Request envelopes, result parcels and the free lists that recycle them
//!
//! Every request crosses the actor boundary in an [`Envelope`] and comes back
//! in a [`Parcel`]. Both are taken from a [`Recycler`] right before
//! submission and handed back right after the outcome is read, so a busy
//! transport does not allocate a fresh carrier pair per request.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::sync::{Mutex, PoisonError};
use tokio::sync::oneshot;

use super::error::{TransportError, WorkError};
use crate::pool::Connection;

/// Type-erased work output
pub type Payload = Box<dyn Any + Send>;

/// Unit of work as the worker sees it
///
/// The closure may run several times for one request (retries), each time
/// against the connection the worker picked.
pub type ErasedWork<Cl> = Box<
    dyn for<'a> FnMut(&'a mut Connection<Cl>) -> BoxFuture<'a, Result<Payload, WorkError>> + Send,
>;

/// Number of idle carriers kept per free list
pub const RECYCLER_CAPACITY: usize = 64;

fn signature<Cl, F>(f: F) -> F
where
    F: for<'a> FnMut(&'a mut Connection<Cl>) -> BoxFuture<'a, Result<Payload, WorkError>>,
{
    f
}

/// Box a typed unit of work behind the erased signature
pub(crate) fn erase<Cl, T, F>(mut work: F) -> ErasedWork<Cl>
where
    Cl: 'static,
    T: Send + 'static,
    F: for<'a> FnMut(&'a mut Connection<Cl>) -> BoxFuture<'a, Result<T, WorkError>> + Send + 'static,
{
    Box::new(signature(move |conn: &mut Connection<Cl>| {
        work(conn)
            .map(|outcome| outcome.map(|value| Box::new(value) as Payload))
            .boxed()
    }))
}

/// Objects that can be returned to a zero baseline
pub trait Reset {
    fn reset(&mut self);
}

/// Thread-safe free list with get-and-reset semantics
///
/// Acquire hands out a reset object (recycled or new); release resets it and
/// keeps it for reuse while the list has room. A recycled object carries no
/// state from its previous request.
#[derive(Debug)]
pub struct Recycler<T> {
    free: Mutex<Vec<Box<T>>>,
    capacity: usize,
}

impl<T: Reset + Default> Recycler<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn acquire(&self) -> Box<T> {
        let recycled = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();

        match recycled {
            Some(mut item) => {
                item.reset();
                item
            }
            None => Box::default(),
        }
    }

    pub fn release(&self, mut item: Box<T>) {
        item.reset();
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() < self.capacity {
            free.push(item);
        }
    }

    /// Objects currently waiting for reuse
    pub fn idle(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl<T: Reset + Default> Default for Recycler<T> {
    fn default() -> Self {
        Self::new(RECYCLER_CAPACITY)
    }
}

/// Carries one unit of work and its reply channel to the worker
pub struct Envelope<Cl> {
    work: Option<ErasedWork<Cl>>,
    reply: Option<oneshot::Sender<Box<Parcel>>>,
}

impl<Cl> Envelope<Cl> {
    pub(crate) fn load(&mut self, work: ErasedWork<Cl>, reply: oneshot::Sender<Box<Parcel>>) {
        self.work = Some(work);
        self.reply = Some(reply);
    }

    pub(crate) fn take_work(&mut self) -> Option<ErasedWork<Cl>> {
        self.work.take()
    }

    pub(crate) fn take_reply(&mut self) -> Option<oneshot::Sender<Box<Parcel>>> {
        self.reply.take()
    }
}

impl<Cl> Default for Envelope<Cl> {
    fn default() -> Self {
        Self {
            work: None,
            reply: None,
        }
    }
}

impl<Cl> Reset for Envelope<Cl> {
    fn reset(&mut self) {
        self.work = None;
        self.reply = None;
    }
}

/// Carries one request's outcome back to the caller
#[derive(Default)]
pub struct Parcel {
    item: Option<Payload>,
    error: Option<TransportError>,
    attempts: u32,
}

impl Parcel {
    pub(crate) fn fill(&mut self, outcome: Result<Payload, TransportError>, attempts: u32) {
        match outcome {
            Ok(item) => self.item = Some(item),
            Err(err) => self.error = Some(err),
        }
        self.attempts = attempts;
    }

    /// Attempts the worker made for this request
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub(crate) fn take_outcome<T: 'static>(&mut self) -> Result<T, TransportError> {
        if let Some(err) = self.error.take() {
            return Err(err);
        }

        self.item
            .take()
            .and_then(|item| item.downcast::<T>().ok())
            .map(|item| *item)
            .ok_or(TransportError::Undelivered)
    }
}

impl Reset for Parcel {
    fn reset(&mut self) {
        self.item = None;
        self.error = None;
        self.attempts = 0;
    }
}
