//! Coroutine channel: ordered wait lists (`producers`, `consumers`) plus
//! capacity bookkeeping, delivering straight through if unbuffered and a
//! consumer/producer is already waiting, else enqueue-and-yield.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use crate::coroutine::{self, Id};
use crate::error::{Code, Error, Result};
use crate::event::{self, Timeout};

struct Inner<T> {
    storage: VecDeque<T>,
    capacity: usize,
    producers: VecDeque<Id>,
    consumers: VecDeque<Id>,
    closed: bool,
    reuse: bool,
    /// A rendezvous slot used by unbuffered channels to hand a value
    /// straight from a parked producer to the consumer that wakes it
    /// (and vice versa), without ever touching `storage`.
    handoff: Option<T>,
}

/// A channel shared by any number of producer/consumer coroutines on one
/// runtime. Not `Send` — coroutines never migrate across runtimes.
pub struct Channel<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Channel { inner: self.inner.clone() }
    }
}

impl<T> Channel<T> {
    /// `capacity == 0` makes an unbuffered (rendezvous) channel.
    pub fn new(capacity: usize) -> Channel<T> {
        Channel {
            inner: Rc::new(RefCell::new(Inner {
                storage: VecDeque::new(),
                capacity,
                producers: VecDeque::new(),
                consumers: VecDeque::new(),
                closed: false,
                reuse: false,
                handoff: None,
            })),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.borrow().capacity
    }

    /// Wakes waiters on `list` until either it's empty or a round made no
    /// progress, guarding against wake-without-consume anomalies.
    fn notify_one(list: &mut VecDeque<Id>) {
        while let Some(id) = list.pop_front() {
            if coroutine::resume(id, 0).is_ok() {
                break;
            }
        }
    }

    /// Attempts the push without ever parking. `Ok(None)` if it completed
    /// (straight handoff or buffered), `Ok(Some(data))` handing the value
    /// back if nothing could take it right now, `Err` if closed.
    fn try_push(&self, data: T) -> Result<Option<T>> {
        let mut inner = self.inner.borrow_mut();
        if inner.closed {
            return Err(Error::new(Code::Eclosed, "push on a closed channel"));
        }
        if let Some(consumer) = inner.consumers.pop_front() {
            inner.handoff = Some(data);
            drop(inner);
            let _ = coroutine::resume(consumer, 0);
            return Ok(None);
        }
        if inner.storage.len() < inner.capacity {
            inner.storage.push_back(data);
            let mut consumers = std::mem::take(&mut inner.consumers);
            drop(inner);
            Self::notify_one(&mut consumers);
            self.inner.borrow_mut().consumers.extend(consumers);
            return Ok(None);
        }
        Ok(Some(data))
    }

    pub fn push(&self, data: T, timeout_ms: i64) -> Result<()> {
        let data = match self.try_push(data)? {
            None => return Ok(()),
            Some(data) => data,
        };
        {
            let mut inner = self.inner.borrow_mut();
            inner.producers.push_back(coroutine::current());
            inner.handoff = Some(data);
        }

        let result = event::suspend_with_timeout(Timeout::from_millis(timeout_ms));
        let mut inner = self.inner.borrow_mut();
        let me = coroutine::current();
        inner.producers.retain(|id| *id != me);
        match result {
            Ok(_) if inner.closed && inner.handoff.is_some() => {
                inner.handoff = None;
                Err(Error::new(Code::Eclosed, "push canceled by close()"))
            }
            Ok(_) => {
                inner.handoff = None;
                Ok(())
            }
            Err(e) => {
                inner.handoff = None;
                Err(e)
            }
        }
    }

    /// Attempts the pop without ever parking. `Ok(Some(value))` if one was
    /// retrieved, `Ok(None)` if nothing is available yet, `Err` if closed
    /// and drained.
    fn try_pop(&self) -> Result<Option<T>> {
        let mut inner = self.inner.borrow_mut();
        if let Some(value) = inner.storage.pop_front() {
            let mut producers = std::mem::take(&mut inner.producers);
            drop(inner);
            Self::notify_one(&mut producers);
            self.inner.borrow_mut().producers.extend(producers);
            return Ok(Some(value));
        }
        if inner.closed {
            return Err(Error::new(Code::Eclosed, "pop on a closed, drained channel"));
        }
        if let Some(producer) = inner.producers.pop_front() {
            drop(inner);
            let _ = coroutine::resume(producer, 0);
            let mut inner = self.inner.borrow_mut();
            if let Some(value) = inner.handoff.take() {
                return Ok(Some(value));
            }
            // producer woke but left nothing (closed mid-handoff); not ready.
            return Ok(None);
        }
        Ok(None)
    }

    pub fn pop(&self, timeout_ms: i64) -> Result<T> {
        if let Some(value) = self.try_pop()? {
            return Ok(value);
        }
        {
            let mut inner = self.inner.borrow_mut();
            inner.consumers.push_back(coroutine::current());
        }

        let result = event::suspend_with_timeout(Timeout::from_millis(timeout_ms));
        let mut inner = self.inner.borrow_mut();
        let me = coroutine::current();
        inner.consumers.retain(|id| *id != me);
        match result {
            Ok(_) => match inner.handoff.take() {
                Some(value) => Ok(value),
                None if inner.closed => Err(Error::new(Code::Eclosed, "pop canceled by close()")),
                None => Err(Error::new(Code::Ecanceled, "pop resumed with no value delivered")),
            },
            Err(e) => Err(e),
        }
    }

    /// Sets whether `close()` leaves the channel usable afterward.
    pub fn set_reuse(&self, reuse: bool) {
        self.inner.borrow_mut().reuse = reuse;
    }

    /// Wakes every waiter with `ECLOSED` and drains buffered storage,
    /// running `destructor` on each dropped item.
    pub fn close(&self, mut destructor: impl FnMut(T)) {
        let (producers, consumers, storage, reuse) = {
            let mut inner = self.inner.borrow_mut();
            inner.closed = true;
            let storage = std::mem::take(&mut inner.storage);
            let producers = std::mem::take(&mut inner.producers);
            let consumers = std::mem::take(&mut inner.consumers);
            (producers, consumers, storage, inner.reuse)
        };
        for item in storage {
            destructor(item);
        }
        for id in producers {
            let _ = coroutine::resume(id, 0);
        }
        for id in consumers {
            let _ = coroutine::resume(id, 0);
        }
        if reuse {
            self.inner.borrow_mut().closed = false;
        }
    }
}

/// One leg of a `select()` call: push or pop against a specific channel.
/// A `Push` leg's payload is taken out on the attempt that finally succeeds
/// and handed back into the slot on every attempt that doesn't, so the same
/// value can be retried on the next pass.
pub enum SelectOp<'a, T> {
    Push(&'a Channel<T>, Option<T>),
    Pop(&'a Channel<T>),
}

impl<'a, T> SelectOp<'a, T> {
    pub fn push(ch: &'a Channel<T>, data: T) -> Self {
        SelectOp::Push(ch, Some(data))
    }

    pub fn pop(ch: &'a Channel<T>) -> Self {
        SelectOp::Pop(ch)
    }
}

/// Awaits the first of several channel operations to complete. Tries every
/// leg non-blockingly on each pass; the winning leg's side effect (the push
/// actually lands, the pop's value is actually taken) happens as part of
/// the attempt that reports it ready. Returns the winning leg's index and,
/// for a `Pop` leg, the value it retrieved.
pub fn select<T>(requests: &mut [SelectOp<T>], timeout_ms: i64) -> Result<(usize, Option<T>)> {
    let deadline = if timeout_ms < 0 { None } else { Some(Duration::from_millis(timeout_ms as u64)) };
    let start = std::time::Instant::now();
    loop {
        for (idx, op) in requests.iter_mut().enumerate() {
            match op {
                SelectOp::Push(ch, slot) => {
                    if let Some(data) = slot.take() {
                        match ch.try_push(data) {
                            Ok(None) => return Ok((idx, None)),
                            Ok(Some(back)) => *slot = Some(back),
                            Err(e) => return Err(e),
                        }
                    }
                }
                SelectOp::Pop(ch) => match ch.try_pop() {
                    Ok(Some(value)) => return Ok((idx, Some(value))),
                    Ok(None) => {}
                    Err(e) => return Err(e),
                },
            }
        }
        if let Some(d) = deadline {
            if start.elapsed() >= d {
                return Err(Error::new(Code::Etimedout, "select timed out"));
            }
        }
        event::wait(Some(Duration::from_millis(1))).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbuffered_handoff() {
        let ch: Channel<i32> = Channel::new(0);
        let producer_ch = ch.clone();
        let id = coroutine::create(0, move || {
            producer_ch.push(42, -1).unwrap();
        })
        .unwrap();
        coroutine::resume(id, 0).unwrap();

        let value = ch.pop(-1).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn buffered_capacity() {
        let ch: Channel<i32> = Channel::new(2);
        ch.push(1, -1).unwrap();
        ch.push(2, -1).unwrap();
        assert_eq!(ch.pop(-1).unwrap(), 1);
        assert_eq!(ch.pop(-1).unwrap(), 2);
    }

    #[test]
    fn select_pops_from_whichever_leg_is_ready() {
        let a: Channel<i32> = Channel::new(1);
        let b: Channel<i32> = Channel::new(1);
        b.push(7, -1).unwrap();

        let mut requests = [SelectOp::pop(&a), SelectOp::pop(&b)];
        let (idx, value) = select(&mut requests, 0).unwrap();
        assert_eq!(idx, 1);
        assert_eq!(value, Some(7));
        assert!(b.is_empty());
    }

    #[test]
    fn select_delivers_a_ready_push_to_its_consumer() {
        let ch: Channel<i32> = Channel::new(0);
        let consumer_ch = ch.clone();
        let id = coroutine::create(0, move || {
            assert_eq!(consumer_ch.pop(-1).unwrap(), 99);
        })
        .unwrap();
        coroutine::resume(id, 0).unwrap();

        let mut requests = [SelectOp::push(&ch, 99)];
        let (idx, value) = select(&mut requests, 0).unwrap();
        assert_eq!(idx, 0);
        assert_eq!(value, None);
    }

    #[test]
    fn close_wakes_waiters_with_eclosed() {
        let ch: Channel<i32> = Channel::new(0);
        let waiter_ch = ch.clone();
        let id = coroutine::create(0, move || {
            let result = waiter_ch.pop(-1);
            assert_eq!(result.unwrap_err().code, Code::Eclosed);
        })
        .unwrap();
        coroutine::resume(id, 0).unwrap();
        ch.close(|_| {});
    }
}
