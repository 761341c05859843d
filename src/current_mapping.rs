//! Holds the active mapping and schedules its renewal.

use std::{
    future::Future,
    net::{IpAddr, SocketAddr},
    num::NonZeroU16,
    pin::Pin,
    task::{Context, Poll},
};

use futures::Stream;
use tokio::{
    sync::watch,
    time::{self, Sleep},
};
use tracing::trace;

use crate::mapping::{Mapping, PortMapped};

/// Cell holding the mapping currently installed on the gateway.
///
/// Publishes the external address on a watch channel and, while a mapping is
/// installed, acts as a stream of renewal events: [`Event::Renew`] at
/// `expiry - max(60s, lifetime / 2)` and [`Event::Expired`] at expiry.
///
/// The stream must be driven by the same task that calls [`CurrentMapping::update`];
/// deadline changes are only picked up on the next poll.
#[derive(Debug)]
pub(super) struct CurrentMapping<M = Mapping> {
    mapping: Option<M>,
    deadlines: Option<Deadlines>,
    address_tx: watch::Sender<Option<SocketAddr>>,
}

#[derive(Debug)]
struct Deadlines {
    external_ip: IpAddr,
    external_port: NonZeroU16,
    renew: Pin<Box<Sleep>>,
    expire: Pin<Box<Sleep>>,
    renew_sent: bool,
}

/// Lifecycle event of the active mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Event {
    /// The mapping is due for renewal.
    Renew {
        /// External ip of the mapping.
        external_ip: IpAddr,
        /// External port of the mapping.
        external_port: NonZeroU16,
    },
    /// The mapping expired without a successful renewal.
    Expired {
        /// External ip of the mapping.
        external_ip: IpAddr,
        /// External port of the mapping.
        external_port: NonZeroU16,
    },
}

impl<M: PortMapped> CurrentMapping<M> {
    pub(super) fn new() -> (Self, watch::Receiver<Option<SocketAddr>>) {
        let (address_tx, address_rx) = watch::channel(None);
        let current = CurrentMapping {
            mapping: None,
            deadlines: None,
            address_tx,
        };
        (current, address_rx)
    }

    /// Install or clear the mapping, returning the previous one.
    ///
    /// The new external address is published and the renewal deadlines are
    /// rescheduled. Whether the returned mapping should be released is the
    /// caller's decision.
    pub(super) fn update(&mut self, mapping: Option<M>) -> Option<M> {
        trace!("new mapping: {mapping:?}");
        let old = std::mem::replace(&mut self.mapping, mapping);
        self.deadlines = self.mapping.as_ref().map(|mapping| {
            let (external_ip, external_port) = mapping.external();
            let now = time::Instant::now();
            Deadlines {
                external_ip,
                external_port,
                renew: Box::pin(time::sleep_until(now + mapping.renew_after())),
                expire: Box::pin(time::sleep_until(now + mapping.lifetime())),
                renew_sent: false,
            }
        });

        let external = self.mapping.as_ref().map(|mapping| {
            let (ip, port) = mapping.external();
            SocketAddr::new(ip, port.get())
        });
        self.address_tx.send_if_modified(|current| {
            if *current == external {
                false
            } else {
                *current = external;
                true
            }
        });
        old
    }

    /// Remove the mapping to work on it, keeping the published address.
    ///
    /// The renewal deadlines stop until a mapping is reinstalled with
    /// [`CurrentMapping::update`].
    pub(super) fn take(&mut self) -> Option<M> {
        self.deadlines = None;
        self.mapping.take()
    }

    /// The external endpoint of the active mapping, if any.
    pub(super) fn external(&self) -> Option<(IpAddr, NonZeroU16)> {
        self.mapping.as_ref().map(PortMapped::external)
    }
}

impl<M: PortMapped> Stream for CurrentMapping<M> {
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        let this = self.get_mut();
        let Some(deadlines) = this.deadlines.as_mut() else {
            return Poll::Pending;
        };
        if !deadlines.renew_sent && deadlines.renew.as_mut().poll(cx).is_ready() {
            deadlines.renew_sent = true;
            return Poll::Ready(Some(Event::Renew {
                external_ip: deadlines.external_ip,
                external_port: deadlines.external_port,
            }));
        }
        if deadlines.expire.as_mut().poll(cx).is_ready() {
            let event = Event::Expired {
                external_ip: deadlines.external_ip,
                external_port: deadlines.external_port,
            };
            this.deadlines = None;
            return Poll::Ready(Some(event));
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;

    use super::*;

    #[derive(Debug)]
    struct TestMapping {
        lifetime: Duration,
    }

    impl PortMapped for TestMapping {
        fn external(&self) -> (IpAddr, NonZeroU16) {
            ("203.0.113.7".parse().unwrap(), NonZeroU16::new(9000).unwrap())
        }

        fn lifetime(&self) -> Duration {
            self.lifetime
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_and_expire_events() {
        let (mut current, watcher) = CurrentMapping::<TestMapping>::new();
        let start = time::Instant::now();
        current.update(Some(TestMapping {
            lifetime: Duration::from_secs(300),
        }));
        assert_eq!(
            *watcher.borrow(),
            Some("203.0.113.7:9000".parse().unwrap())
        );

        // renew at lifetime - max(60, lifetime / 2)
        let event = current.next().await.unwrap();
        assert!(matches!(event, Event::Renew { .. }));
        assert_eq!(start.elapsed(), Duration::from_secs(150));

        let event = current.next().await.unwrap();
        assert!(matches!(event, Event::Expired { .. }));
        assert_eq!(start.elapsed(), Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_publishes_and_returns_the_old_mapping() {
        let (mut current, watcher) = CurrentMapping::<TestMapping>::new();
        assert!(current
            .update(Some(TestMapping {
                lifetime: Duration::from_secs(100),
            }))
            .is_none());
        assert!(current.update(None).is_some());
        assert_eq!(*watcher.borrow(), None);
        assert!(current.external().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_stops_the_deadlines() {
        let (mut current, watcher) = CurrentMapping::<TestMapping>::new();
        current.update(Some(TestMapping {
            lifetime: Duration::from_secs(100),
        }));
        let taken = CurrentMapping::take(&mut current);
        assert!(taken.is_some());
        // the address stays published while the mapping is being worked on
        assert!(watcher.borrow().is_some());

        // no event fires without deadlines
        let next = tokio::time::timeout(Duration::from_secs(1000), current.next()).await;
        assert!(next.is_err(), "no event should fire after take()");
    }
}
