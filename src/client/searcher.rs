//! UDP name resolution
//!
//! Every name asked for is searched for in one datagram to all broadcast addresses,
//! then retried with exponential backoff (capped at `EPICS_CA_MAX_SEARCH_PERIOD`)
//! until a server replies or the search times out. Concurrent requests for the same
//! name share one search, which is abandoned once nobody is waiting for it.

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    time::{Duration, Instant},
};
use tokio::{
    io,
    net::UdpSocket,
    select,
    sync::{
        broadcast::{self, error::TryRecvError},
        mpsc, oneshot,
    },
    time::sleep_until,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::{
    messages::{Message, Search, Version},
    utils::{
        get_default_max_search_interval, get_default_server_port, get_target_broadcast_ips,
        wrapping_inplace_add,
    },
};

/// First retry interval, doubled on every retry
const INITIAL_BACKOFF: Duration = Duration::from_millis(32);

#[derive(thiserror::Error, Debug)]
#[error("Could not find PV {0}")]
pub struct CouldNotFindError(pub String);

struct SearchRequest {
    name: String,
    /// Where to wait for the result
    reply: oneshot::Sender<broadcast::Receiver<Option<SocketAddr>>>,
}

pub struct SearcherBuilder {
    search_port: u16,
    stop_token: CancellationToken,
    broadcast_addresses: Option<Vec<SocketAddr>>,
    timeout: Option<Duration>,
    max_interval: Duration,
    /// Local address replies are received on
    bind_address: SocketAddr,
}

impl Default for SearcherBuilder {
    fn default() -> Self {
        SearcherBuilder {
            search_port: get_default_server_port(),
            stop_token: CancellationToken::new(),
            broadcast_addresses: None,
            timeout: Some(Duration::from_secs(5)),
            max_interval: get_default_max_search_interval(),
            bind_address: SocketAddr::from(([0, 0, 0, 0], 0)),
        }
    }
}

impl SearcherBuilder {
    pub fn new() -> Self {
        SearcherBuilder::default()
    }

    pub async fn start(self) -> Result<Searcher, io::Error> {
        let socket = UdpSocket::bind(self.bind_address).await?;
        socket.set_broadcast(true)?;
        let broadcast_addresses = self
            .broadcast_addresses
            .unwrap_or_else(|| get_target_broadcast_ips(self.search_port));
        debug!("Searching on {broadcast_addresses:?}");

        let (requests_tx, requests_rx) = mpsc::channel(32);
        let internal = SearcherInternal {
            broadcast_addresses,
            timeout: self.timeout,
            max_interval: self.max_interval,
            ..Default::default()
        };
        tokio::spawn(internal.run(socket, requests_rx, self.stop_token.clone()));
        Ok(Searcher {
            requests: requests_tx,
            stop_token: self.stop_token,
        })
    }

    /// Stop searching when `token` is cancelled
    pub fn stop_token(mut self, token: CancellationToken) -> Self {
        self.stop_token = token.child_token();
        self
    }
    /// Port that searches are sent to, when broadcasting to discovered interfaces
    pub fn search_port(mut self, port: u16) -> Self {
        self.search_port = port;
        self
    }
    /// How long a name is searched for before giving up. `None` searches forever.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
    /// Send searches to these addresses instead of the EPICS environment's
    pub fn broadcast_to(mut self, addresses: Vec<SocketAddr>) -> Self {
        self.broadcast_addresses = Some(addresses);
        self
    }
}

/// Resolves PV names to the address of the server hosting them
#[derive(Debug)]
pub struct Searcher {
    requests: mpsc::Sender<SearchRequest>,
    stop_token: CancellationToken,
}

impl Searcher {
    /// Start searching for a PV, leaving the search running in the background
    pub async fn begin(&self, name: &str) -> Result<PendingSearch, CouldNotFindError> {
        let not_found = || CouldNotFindError(name.to_owned());
        let (reply, receiver) = oneshot::channel();
        self.requests
            .send(SearchRequest {
                name: name.to_owned(),
                reply,
            })
            .await
            .map_err(|_| not_found())?;
        Ok(PendingSearch {
            name: name.to_owned(),
            results: receiver.await.map_err(|_| not_found())?,
        })
    }

    /// Find the server hosting a PV
    pub async fn search_for(&self, name: &str) -> Result<SocketAddr, CouldNotFindError> {
        self.begin(name).await?.wait().await
    }

    pub fn stop(&self) {
        self.stop_token.cancel();
    }
}

impl Drop for Searcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A search still running in the searcher task
///
/// Dropping this abandons the search, unless someone else is waiting for the same
/// name.
#[derive(Debug)]
pub struct PendingSearch {
    name: String,
    results: broadcast::Receiver<Option<SocketAddr>>,
}

impl PendingSearch {
    /// The outcome, if the search has finished
    pub fn poll(&mut self) -> Option<Result<SocketAddr, CouldNotFindError>> {
        match self.results.try_recv() {
            Ok(Some(server)) => Some(Ok(server)),
            Err(TryRecvError::Empty) => None,
            Ok(None) | Err(_) => Some(Err(CouldNotFindError(self.name.clone()))),
        }
    }

    /// Wait for the search to finish
    pub async fn wait(&mut self) -> Result<SocketAddr, CouldNotFindError> {
        self.results
            .recv()
            .await
            .ok()
            .flatten()
            .ok_or_else(|| CouldNotFindError(self.name.clone()))
    }
}

/// Progress of the search for one name
#[derive(Debug)]
struct SearchAttempt {
    name: String,
    expires_at: Option<Instant>,
    /// Every search ID sent for this name so far
    search_ids: Vec<u32>,
    next_search_at: Instant,
    /// Result for everyone waiting on this name
    reporter: broadcast::Sender<Option<SocketAddr>>,
}

impl SearchAttempt {
    fn new(name: String, timeout: Option<Duration>) -> Self {
        let now = Instant::now();
        SearchAttempt {
            name,
            expires_at: timeout.map(|t| now + t),
            search_ids: Vec::new(),
            next_search_at: now,
            reporter: broadcast::channel(1).0,
        }
    }

    /// Build the next search message, and schedule the one after
    fn search(&mut self, search_id: u32, max_interval: Duration) -> Search {
        let backoff = INITIAL_BACKOFF * 2u32.pow(self.search_ids.len().min(11) as u32);
        self.search_ids.push(search_id);
        self.next_search_at = Instant::now() + backoff.min(max_interval);
        Search {
            search_id,
            channel_name: self.name.clone(),
            ..Default::default()
        }
    }
}

/// One datagram: a version message, then the searches
fn datagram(searches: Vec<Search>) -> Vec<u8> {
    std::iter::once(Message::from(Version::default()))
        .chain(searches.into_iter().map(Message::from))
        .flat_map(|m| m.as_bytes())
        .collect()
}

/// Searcher state, owned by the search task
#[derive(Default)]
struct SearcherInternal {
    broadcast_addresses: Vec<SocketAddr>,
    /// Name searched for by each outstanding search ID
    in_flight: HashMap<u32, String>,
    attempts: HashMap<String, SearchAttempt>,
    search_id: u32,
    timeout: Option<Duration>,
    max_interval: Duration,
}

impl SearcherInternal {
    async fn run(
        mut self,
        socket: UdpSocket,
        mut requests: mpsc::Receiver<SearchRequest>,
        stop: CancellationToken,
    ) {
        let mut buffer = vec![0u8; 0xFFFF];
        let mut batch = Vec::new();
        loop {
            let wake = self.next_wake();
            select! {
                _ = stop.cancelled() => break,
                received = requests.recv_many(&mut batch, 32) => {
                    if received == 0 {
                        break;
                    }
                    let searches = batch.drain(..).map(|r| self.register(r)).collect();
                    self.send_to_all(&socket, &datagram(searches)).await;
                }
                result = socket.recv_from(&mut buffer) => match result {
                    Ok((size, sender)) => self.handle_response(&buffer[..size], sender),
                    Err(e) => error!("Error waiting for search responses: {e}"),
                },
                _ = sleep_until(wake.unwrap_or_else(Instant::now).into()), if wake.is_some() => {
                    self.expire_searches();
                    let retries = self.retries();
                    if !retries.is_empty() {
                        self.send_to_all(&socket, &datagram(retries)).await;
                    }
                }
            }
        }
        debug!("Searcher stopped");
    }

    fn next_wake(&self) -> Option<Instant> {
        self.attempts
            .values()
            .flat_map(|a| [Some(a.next_search_at), a.expires_at])
            .flatten()
            .min()
    }

    async fn send_to_all(&self, socket: &UdpSocket, packet: &[u8]) {
        for addr in &self.broadcast_addresses {
            trace!("Sending search packet to {addr}");
            if let Err(e) = socket.send_to(packet, *addr).await {
                warn!("Failed to send search to {addr}: {e}");
            }
        }
    }

    fn register(&mut self, request: SearchRequest) -> Search {
        let timeout = self.timeout;
        let search_id = wrapping_inplace_add(&mut self.search_id);
        let attempt = self
            .attempts
            .entry(request.name.clone())
            .or_insert_with(|| SearchAttempt::new(request.name.clone(), timeout));
        let _ = request.reply.send(attempt.reporter.subscribe());
        self.in_flight.insert(search_id, request.name.clone());
        debug!("Searching for {}", request.name);
        attempt.search(search_id, self.max_interval)
    }

    /// Report the result of a search to its waiters, and forget it
    fn finish(&mut self, attempt: SearchAttempt, result: Option<SocketAddr>) {
        for search_id in &attempt.search_ids {
            self.in_flight.remove(search_id);
        }
        let _ = attempt.reporter.send(result);
    }

    fn handle_response(&mut self, response: &[u8], sender: SocketAddr) {
        let messages = match Message::parse_many_client_messages(response) {
            Ok(messages) => messages,
            Err(e) => {
                warn!("Received unparseable search response from {sender}: {e}");
                return;
            }
        };
        for message in messages {
            let reply = match message {
                Message::SearchResponse(reply) => reply,
                Message::Version(_) => continue,
                other => {
                    warn!("Received unexpected search response: {other:?}");
                    continue;
                }
            };
            let Some(attempt) = self
                .in_flight
                .remove(&reply.search_id)
                .and_then(|name| self.attempts.remove(&name))
            else {
                debug!("Ignoring reply to unknown or answered search {}", reply.search_id);
                continue;
            };
            let server = SocketAddr::new(
                reply.server_ip.map_or(sender.ip(), IpAddr::from),
                reply.port_number,
            );
            debug!("Found {} on {server}", attempt.name);
            self.finish(attempt, Some(server));
        }
    }

    /// Drop searches that have timed out, or that nobody is waiting for
    fn expire_searches(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .attempts
            .values()
            .filter(|a| {
                a.reporter.receiver_count() == 0 || a.expires_at.is_some_and(|t| t <= now)
            })
            .map(|a| a.name.clone())
            .collect();
        for name in expired {
            if let Some(attempt) = self.attempts.remove(&name) {
                if attempt.reporter.receiver_count() == 0 {
                    debug!("Abandoning search for {name}");
                } else {
                    debug!(
                        "Giving up search for {name} after {} attempts",
                        attempt.search_ids.len()
                    );
                }
                self.finish(attempt, None);
            }
        }
    }

    fn retries(&mut self) -> Vec<Search> {
        let now = Instant::now();
        let mut searches = Vec::new();
        for attempt in self
            .attempts
            .values_mut()
            .filter(|a| a.next_search_at <= now)
        {
            let search_id = wrapping_inplace_add(&mut self.search_id);
            self.in_flight.insert(search_id, attempt.name.clone());
            trace!("Retrying search for {}", attempt.name);
            searches.push(attempt.search(search_id, self.max_interval));
        }
        searches
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::messages::CAMessage;

    #[tokio::test(flavor = "current_thread")]
    async fn test_search() {
        let incoming = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = incoming.local_addr().unwrap();

        let subtask = tokio::spawn(async move {
            let s = SearcherBuilder::new()
                .broadcast_to(vec![target])
                .start()
                .await
                .unwrap();
            assert_eq!(
                s.search_for("TEST").await.unwrap(),
                "127.0.0.1:6464".parse().unwrap()
            );
        });

        let mut buffer = [0u8; 16384];
        let (size, source) = incoming.recv_from(&mut buffer).await.unwrap();
        let messages = Message::parse_many_server_messages(&buffer[..size]).unwrap();
        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[0], Message::Version(_)));
        let Message::Search(search_msg) = &messages[1] else {
            panic!("Didn't get a search message");
        };
        assert_eq!(search_msg.channel_name, "TEST");

        // No server address in the reply, so the sender's is used
        incoming
            .send_to(&search_msg.respond(None, 6464, true).as_bytes(), source)
            .await
            .unwrap();

        subtask.await.unwrap();
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unanswered_search_times_out() {
        // Nobody answers on this socket
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let s = SearcherBuilder::new()
            .broadcast_to(vec![silent.local_addr().unwrap()])
            .timeout(Some(Duration::from_millis(200)))
            .start()
            .await
            .unwrap();
        let err = s.search_for("NOBODY:HOME").await.unwrap_err();
        assert_eq!(err.to_string(), "Could not find PV NOBODY:HOME");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn pending_search_resolves_in_background() {
        let incoming = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let s = SearcherBuilder::new()
            .broadcast_to(vec![incoming.local_addr().unwrap()])
            .timeout(None)
            .start()
            .await
            .unwrap();
        let mut pending = s.begin("LATER").await.unwrap();
        assert!(pending.poll().is_none());

        let mut buffer = [0u8; 16384];
        let (size, source) = incoming.recv_from(&mut buffer).await.unwrap();
        let messages = Message::parse_many_server_messages(&buffer[..size]).unwrap();
        let Message::Search(search_msg) = &messages[1] else {
            panic!("Didn't get a search message");
        };
        incoming
            .send_to(
                &search_msg
                    .respond(Some([127, 0, 0, 2].into()), 7000, true)
                    .as_bytes(),
                source,
            )
            .await
            .unwrap();
        assert_eq!(pending.wait().await.unwrap(), "127.0.0.2:7000".parse().unwrap());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn abandoned_search_is_not_retried() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let s = SearcherBuilder::new()
            .broadcast_to(vec![silent.local_addr().unwrap()])
            .timeout(None)
            .start()
            .await
            .unwrap();
        drop(s.begin("NOBODY:CARES").await.unwrap());

        let mut buffer = [0u8; 16384];
        silent.recv_from(&mut buffer).await.unwrap();
        // The first retry would be due after 32ms
        assert!(
            tokio::time::timeout(Duration::from_millis(300), silent.recv_from(&mut buffer))
                .await
                .is_err()
        );
    }

    #[test]
    fn retries_back_off() {
        let max_interval = Duration::from_millis(100);
        let mut attempt = SearchAttempt::new("PV".to_owned(), None);
        let mut intervals = Vec::new();
        for id in 0..4 {
            let before = Instant::now();
            let search = attempt.search(id, max_interval);
            assert_eq!(search.search_id, id);
            intervals.push(attempt.next_search_at.duration_since(before));
        }
        assert!(intervals[0] >= Duration::from_millis(32));
        assert!(intervals[1] >= Duration::from_millis(64));
        assert!(intervals[2] >= max_interval && intervals[2] < Duration::from_millis(128));
        assert_eq!(attempt.search_ids, vec![0, 1, 2, 3]);
    }
}
