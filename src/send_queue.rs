//! Outbound datagram queue with single-drainer discipline.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::Mutex;

/// One datagram on its way out of the process.
///
/// Wrapper to avoid exposing the inner buffer type in the public API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatagramSend(Vec<u8>);

impl DatagramSend {
    /// Consume and return the raw bytes.
    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for DatagramSend {
    fn from(value: Vec<u8>) -> Self {
        DatagramSend(value)
    }
}

impl Deref for DatagramSend {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Shared queue of datagrams pending transmission on one socket.
///
/// Any number of sessions push concurrently, but at most one caller at a
/// time drains toward the socket. [`SendQueue::push`] returning `true`
/// hands the pushing caller the drainer role; it must then call
/// [`SendQueue::next`] until it returns `None`, which releases the role.
/// The gate flips inside the same lock that guards the queue, so a push
/// racing a final empty check is either seen by the current drainer or
/// elects the pusher as the next one. Work can never be left behind with
/// no drainer assigned.
#[derive(Debug, Default)]
pub struct SendQueue {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    queue: VecDeque<(SocketAddr, DatagramSend)>,
    draining: bool,
}

impl SendQueue {
    /// An empty queue with no drainer.
    pub fn new() -> Self {
        SendQueue::default()
    }

    /// Enqueue one datagram for `addr`.
    ///
    /// Returns `true` when the caller became the drainer and must pump
    /// [`SendQueue::next`] until empty.
    pub fn push(&self, addr: SocketAddr, datagram: DatagramSend) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.push_back((addr, datagram));

        if inner.draining {
            false
        } else {
            inner.draining = true;
            true
        }
    }

    /// Pop the next pending datagram.
    ///
    /// `None` releases the drainer role. Only the caller that last got
    /// `true` out of [`SendQueue::push`] should call this.
    pub fn next(&self) -> Option<(SocketAddr, DatagramSend)> {
        let mut inner = self.inner.lock().unwrap();

        match inner.queue.pop_front() {
            Some(item) => Some(item),
            None => {
                // Observed empty under the lock. A later push re-elects.
                inner.draining = false;
                None
            }
        }
    }

    /// Number of datagrams waiting.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    /// Whether no datagrams are waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn dgram(b: &[u8]) -> DatagramSend {
        b.to_vec().into()
    }

    #[test]
    fn first_push_elects_drainer() {
        let q = SendQueue::new();

        assert!(q.push(addr(5000), dgram(b"a")));
        // Drainer already assigned, second pusher is not elected.
        assert!(!q.push(addr(5001), dgram(b"b")));

        let (a0, d0) = q.next().unwrap();
        assert_eq!(a0, addr(5000));
        assert_eq!(&*d0, b"a");
        let (a1, _) = q.next().unwrap();
        assert_eq!(a1, addr(5001));

        // Empty observed under the lock releases the role.
        assert!(q.next().is_none());
        assert!(q.push(addr(5002), dgram(b"c")));
    }

    #[test]
    fn push_during_drain_is_not_lost() {
        let q = SendQueue::new();

        assert!(q.push(addr(1), dgram(b"x")));
        assert!(q.next().is_some());

        // Race shape: a push lands before the drainer's empty check.
        assert!(!q.push(addr(2), dgram(b"y")));

        // The still-active drainer picks it up.
        let (a, _) = q.next().unwrap();
        assert_eq!(a, addr(2));
        assert!(q.next().is_none());
    }

    #[test]
    fn concurrent_pushers_elect_exactly_one() {
        use std::sync::Arc;

        let q = Arc::new(SendQueue::new());
        let mut handles = Vec::new();

        for i in 0..8 {
            let q = Arc::clone(&q);
            handles.push(std::thread::spawn(move || {
                let mut elected = 0;
                for j in 0..100 {
                    if q.push(addr(1000 + i), dgram(&[j])) {
                        // Drain everything we can see, then yield the role.
                        while q.next().is_some() {}
                        elected += 1;
                    }
                }
                elected
            }));
        }

        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert!(total > 0);
        // Everything pushed was drained by someone.
        assert!(q.is_empty());
    }
}
