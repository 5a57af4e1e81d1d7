use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use crate::MAX_INLINE;

/// An unreliable datagram endpoint. Receives must be posted ahead of the
/// sender; a datagram arriving at an endpoint with no posted receive is
/// dropped, never queued.
pub struct Datagram {
    rx: Receiver<Vec<u8>>,
    addr: DgramAddr,
    // Signalled send completions not yet reaped.
    send_pending: usize,
}

/// The address handle a peer uses to send to a [`Datagram`].
#[derive(Clone)]
pub struct DgramAddr {
    tx: Sender<Vec<u8>>,
    credits: Arc<AtomicIsize>,
}

/// One entry of a send post-list. `inline` asks the provider to carry the
/// payload in the descriptor itself instead of gathering it from
/// registered memory; it is only legal for payloads up to [`MAX_INLINE`].
pub struct SendDesc<'a> {
    pub to: &'a DgramAddr,
    pub payload: &'a [u8],
    pub signalled: bool,
    pub inline: bool,
}

impl Datagram {
    pub fn bind() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            rx,
            addr: DgramAddr {
                tx,
                credits: Arc::new(AtomicIsize::new(0)),
            },
            send_pending: 0,
        }
    }

    pub fn addr(&self) -> DgramAddr {
        self.addr.clone()
    }

    /// Post one receive descriptor.
    pub fn post_recv(&self) {
        self.addr.credits.fetch_add(1, Ordering::AcqRel);
    }

    /// Poll for a received datagram.
    pub fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.try_recv().ok()
    }

    /// Post one send. Completes locally whether or not the receiver had a
    /// receive posted; an uncredited datagram is dropped on the floor.
    pub fn post_send(&mut self, desc: &SendDesc<'_>) {
        debug_assert!(!desc.inline || desc.payload.len() <= MAX_INLINE);
        if desc.to.credits.fetch_sub(1, Ordering::AcqRel) <= 0 {
            desc.to.credits.fetch_add(1, Ordering::AcqRel);
            tracing::warn!(
                len = desc.payload.len(),
                "datagram dropped: no posted receive at destination"
            );
        } else if desc.to.tx.send(desc.payload.to_vec()).is_err() {
            tracing::warn!(
                len = desc.payload.len(),
                "datagram dropped: destination endpoint is gone"
            );
        }
        if desc.signalled {
            self.send_pending += 1;
        }
    }

    /// Post a batch of sends as one chained post.
    pub fn post_send_list(&mut self, descs: &[SendDesc<'_>]) {
        for desc in descs {
            self.post_send(desc);
        }
    }

    /// Reap one signalled send completion, if any is outstanding.
    pub fn poll_send_completion(&mut self) -> bool {
        if self.send_pending > 0 {
            self.send_pending -= 1;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn delivery_requires_a_posted_receive() {
        let mut rx_side = Datagram::bind();
        let addr = rx_side.addr();
        let mut tx_side = Datagram::bind();

        // No credit: dropped.
        tx_side.post_send(&SendDesc {
            to: &addr,
            payload: b"lost",
            signalled: false,
            inline: true,
        });
        assert_eq!(rx_side.recv(), None);

        // With credit: delivered.
        rx_side.post_recv();
        tx_side.post_send(&SendDesc {
            to: &addr,
            payload: b"kept",
            signalled: false,
            inline: true,
        });
        assert_eq!(rx_side.recv(), Some(b"kept".to_vec()));
        assert_eq!(rx_side.recv(), None);
    }

    #[test]
    fn each_receive_credit_admits_one_datagram() {
        let mut rx_side = Datagram::bind();
        let addr = rx_side.addr();
        let mut tx_side = Datagram::bind();

        rx_side.post_recv();
        rx_side.post_recv();
        for payload in [&b"one"[..], b"two", b"three"] {
            tx_side.post_send(&SendDesc {
                to: &addr,
                payload,
                signalled: false,
                inline: true,
            });
        }

        assert_eq!(rx_side.recv(), Some(b"one".to_vec()));
        assert_eq!(rx_side.recv(), Some(b"two".to_vec()));
        assert_eq!(rx_side.recv(), None);
    }

    #[test]
    fn only_signalled_sends_produce_completions() {
        let mut rx_side = Datagram::bind();
        let addr = rx_side.addr();
        let mut tx_side = Datagram::bind();

        for _ in 0..3 {
            rx_side.post_recv();
        }
        tx_side.post_send_list(&[
            SendDesc { to: &addr, payload: b"a", signalled: false, inline: true },
            SendDesc { to: &addr, payload: b"b", signalled: true, inline: true },
            SendDesc { to: &addr, payload: b"c", signalled: false, inline: true },
        ]);

        assert!(tx_side.poll_send_completion());
        assert!(!tx_side.poll_send_completion());
    }
}
