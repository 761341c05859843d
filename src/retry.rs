//! Drives a single datagram exchange to completion with the RFC backoff
//! schedules.
//!
//! NAT-PMP and PCP run over UDP, so every request has to be retransmitted
//! until a matching reply arrives or the schedule is exhausted. The loop here
//! owns that policy; the protocol layers only provide the request bytes and
//! a predicate deciding whether an inbound datagram answers it.

use std::time::Duration;

use rand::Rng;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::Error;

/// Largest datagram either protocol allows. PCP caps packets at 1100 bytes,
/// NAT-PMP stays well below that.
pub(crate) const MAX_DATAGRAM_SIZE: usize = 1100;

/// Initial PCP retransmission interval (RFC 6887 IRT).
const PCP_IRT: Duration = Duration::from_secs(3);

/// Maximum PCP retransmission interval (RFC 6887 MRT).
const PCP_MRT: Duration = Duration::from_secs(1024);

/// Maximum PCP transmissions (RFC 6887 MRC). The RFC allows retransmitting
/// for as long as the mapping is wanted; a client with other protocols to
/// fall back to gives up much earlier.
const PCP_MRC: usize = 4;

/// Initial NAT-PMP timeout (RFC 6886 section 3.1).
const PMP_INITIAL_TIMEOUT: Duration = Duration::from_millis(250);

/// Total NAT-PMP transmissions: the initial send plus eight doubled retries.
const PMP_MAX_TRANSMISSIONS: usize = 9;

/// Retransmission timing for the two datagram protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Schedule {
    /// RFC 6887 section 8.1.1: IRT 3s with a ±25% jitter, doubling on every
    /// retransmission up to MRT 1024s, at most MRC transmissions.
    Pcp,
    /// RFC 6886 section 3.1: 250ms doubling on every retry, nine
    /// transmissions in total (a budget of roughly 128s).
    NatPmp,
}

impl Schedule {
    pub(crate) fn max_transmissions(&self) -> usize {
        match self {
            Schedule::Pcp => PCP_MRC,
            Schedule::NatPmp => PMP_MAX_TRANSMISSIONS,
        }
    }

    /// How long to wait for a reply to transmission number `attempt`
    /// (zero-based) before retransmitting.
    pub(crate) fn timeout<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        match self {
            Schedule::Pcp => {
                let base = PCP_IRT
                    .checked_mul(1u32 << attempt.min(30))
                    .map(|d| d.min(PCP_MRT))
                    .unwrap_or(PCP_MRT);
                base.mul_f64(rng.gen_range(0.75..=1.25))
            }
            Schedule::NatPmp => PMP_INITIAL_TIMEOUT * (1 << attempt),
        }
    }
}

/// A datagram endpoint the retry loop can transmit on.
///
/// The indirection keeps the loop free of sockets so the schedule can be
/// exercised without a network.
pub(crate) trait Transport {
    /// Transmit the request datagram.
    async fn send(&mut self) -> std::io::Result<()>;
    /// Receive the next inbound datagram.
    async fn recv(&mut self) -> std::io::Result<Vec<u8>>;
}

/// [`Transport`] over a connected UDP socket, retransmitting a fixed request.
pub(crate) struct UdpTransport<'a> {
    socket: &'a UdpSocket,
    request: &'a [u8],
}

impl<'a> UdpTransport<'a> {
    pub(crate) fn new(socket: &'a UdpSocket, request: &'a [u8]) -> Self {
        UdpTransport { socket, request }
    }
}

impl Transport for UdpTransport<'_> {
    async fn send(&mut self) -> std::io::Result<()> {
        self.socket.send(self.request).await.map(drop)
    }

    async fn recv(&mut self) -> std::io::Result<Vec<u8>> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let read = self.socket.recv(&mut buf).await?;
        buf.truncate(read);
        Ok(buf)
    }
}

/// Run one request to a response or a terminal failure.
///
/// Returns the first datagram accepted by `matches`. Datagrams that do not
/// match are discarded. Cancellation aborts at the next suspension point
/// without rolling back anything already installed on the gateway.
pub(crate) async fn exchange<T, M>(
    transport: &mut T,
    schedule: Schedule,
    cancel: &CancellationToken,
    mut matches: M,
) -> Result<Vec<u8>, Error>
where
    T: Transport,
    M: FnMut(&[u8]) -> bool,
{
    for attempt in 0..schedule.max_transmissions() {
        transport.send().await?;
        // the rng is not held across suspension points
        let wait = schedule.timeout(attempt as u32, &mut rand::thread_rng());
        let deadline = tokio::time::sleep(wait);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = &mut deadline => break,
                datagram = transport.recv() => {
                    let datagram = datagram?;
                    if matches(&datagram) {
                        return Ok(datagram);
                    }
                    trace!(len = datagram.len(), "discarding datagram that does not answer the pending request");
                }
            }
        }
    }
    Err(Error::Timeout)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use rand::SeedableRng;

    use super::*;

    /// Counts transmissions and serves queued replies, then stays silent.
    struct MockTransport {
        sends: usize,
        replies: VecDeque<Vec<u8>>,
    }

    impl MockTransport {
        fn silent() -> Self {
            MockTransport { sends: 0, replies: VecDeque::new() }
        }
    }

    impl Transport for MockTransport {
        async fn send(&mut self) -> std::io::Result<()> {
            self.sends += 1;
            Ok(())
        }

        async fn recv(&mut self) -> std::io::Result<Vec<u8>> {
            match self.replies.pop_front() {
                Some(reply) => Ok(reply),
                None => std::future::pending().await,
            }
        }
    }

    #[test]
    fn test_pcp_intervals_stay_in_the_jitter_window() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(42);
        for attempt in 0..Schedule::Pcp.max_transmissions() as u32 {
            let timeout = Schedule::Pcp.timeout(attempt, &mut rng);
            let base = Duration::from_secs(3u64 << attempt).min(Duration::from_secs(1024));
            assert!(timeout >= base.mul_f64(0.75), "attempt {attempt}: {timeout:?}");
            assert!(timeout <= base.mul_f64(1.25), "attempt {attempt}: {timeout:?}");
        }
    }

    #[test]
    fn test_pcp_interval_caps_at_mrt() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(42);
        let timeout = Schedule::Pcp.timeout(20, &mut rng);
        assert!(timeout <= Duration::from_secs(1024).mul_f64(1.25));
    }

    #[tokio::test(start_paused = true)]
    async fn test_nat_pmp_schedule_exhausts_after_nine_sends() {
        let start = tokio::time::Instant::now();
        let mut transport = MockTransport::silent();
        let cancel = CancellationToken::new();

        let result = exchange(&mut transport, Schedule::NatPmp, &cancel, |_| true).await;

        assert!(matches!(result, Err(Error::Timeout)));
        assert_eq!(transport.sends, 9);
        // 250ms * (2^9 - 1)
        assert_eq!(start.elapsed(), Duration::from_millis(127_750));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pcp_schedule_exhausts_after_mrc_sends() {
        let mut transport = MockTransport::silent();
        let cancel = CancellationToken::new();

        let result = exchange(&mut transport, Schedule::Pcp, &cancel, |_| true).await;

        assert!(matches!(result, Err(Error::Timeout)));
        assert_eq!(transport.sends, PCP_MRC);
    }

    #[tokio::test(start_paused = true)]
    async fn test_matching_reply_stops_the_loop() {
        let mut transport = MockTransport::silent();
        transport.replies.push_back(vec![0xbe, 0xef]);
        let cancel = CancellationToken::new();

        let reply = exchange(&mut transport, Schedule::NatPmp, &cancel, |d| d == [0xbe, 0xef])
            .await
            .unwrap();

        assert_eq!(reply, vec![0xbe, 0xef]);
        assert_eq!(transport.sends, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_matching_datagrams_are_discarded() {
        let mut transport = MockTransport::silent();
        transport.replies.push_back(vec![0x00]);
        transport.replies.push_back(vec![0xbe, 0xef]);
        let cancel = CancellationToken::new();

        let reply = exchange(&mut transport, Schedule::NatPmp, &cancel, |d| d == [0xbe, 0xef])
            .await
            .unwrap();

        assert_eq!(reply, vec![0xbe, 0xef]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_the_wait() {
        let mut transport = MockTransport::silent();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = exchange(&mut transport, Schedule::NatPmp, &cancel, |_| true).await;

        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
