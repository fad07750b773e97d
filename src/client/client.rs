use std::{
    collections::HashMap,
    net::SocketAddr,
    time::{Duration, Instant},
};
use tokio::{
    io::{self, AsyncWrite, AsyncWriteExt, ReadHalf, split},
    net::TcpStream,
    select,
    sync::{mpsc, oneshot},
    time::sleep_until,
};
use tokio_stream::StreamExt;
use tokio_util::{codec::FramedRead, sync::CancellationToken};
use tracing::{Instrument, debug, debug_span, error, trace, warn};

use crate::{
    client::{PendingSearch, SearcherBuilder, searcher::CouldNotFindError},
    dbr::{Dbr, DbrBasicType, DbrCategory, DbrType, DbrValue},
    messages::{
        self, Access, CA_PROTO_CREATE_CHAN, CA_PROTO_READ_NOTIFY, ClientMessageDecoder,
        ErrorCondition, Message,
    },
    utils::{get_default_connection_timeout, wrapping_inplace_add},
};

use super::Searcher;

/// How long a read waits for a newly lost channel to be found again
const RECONNECT_GRACE: Duration = Duration::from_millis(250);

type Reply<T> = oneshot::Sender<Result<T, ClientError>>;
type ServerStream = FramedRead<ReadHalf<TcpStream>, ClientMessageDecoder>;

/// Work handed from a [`Circuit`] handle to its task
enum CircuitRequest {
    /// Create the named channel, or wait for it if already being created
    Open { name: String, reply: Reply<ChannelInfo> },
    /// ReadNotify of `count` elements, with time metadata
    Read {
        cid: u32,
        count: u32,
        reply: Reply<Dbr>,
    },
}

/// Handle to the task running a TCP virtual circuit to one server
struct Circuit {
    cancel: CancellationToken,
    requests: mpsc::Sender<CircuitRequest>,
}

impl Circuit {
    async fn connect(
        address: SocketAddr,
        client_name: &str,
        host_name: &str,
        echo_period: Duration,
        parent: &CancellationToken,
    ) -> Result<Self, ClientError> {
        debug!("Opening circuit to {address}");
        let tcp = TcpStream::connect(address).await?;
        let (rx, mut tx) = split(tcp);
        let mut incoming = FramedRead::with_capacity(rx, ClientMessageDecoder, 16384usize);
        handshake(&mut incoming, &mut tx, client_name, host_name).await?;

        let (requests, requests_rx) = mpsc::channel(8);
        let cancel = parent.child_token();
        let task = CircuitTask {
            address,
            requests: requests_rx,
            cancel: cancel.clone(),
            next_cid: 0,
            next_ioid: 0,
            channels: HashMap::new(),
            cids: HashMap::new(),
            reads: HashMap::new(),
            keepalive: Keepalive::new(echo_period),
        };
        tokio::spawn(
            task.run(incoming, tx)
                .instrument(debug_span!("circuit", server = %address)),
        );
        Ok(Circuit { cancel, requests })
    }

    fn is_alive(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Send a request to the circuit task and wait for its answer
    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> CircuitRequest,
    ) -> Result<T, ClientError> {
        let (reply, answer) = oneshot::channel();
        self.requests
            .send(make(reply))
            .await
            .map_err(|_| ClientError::ChannelClosed)?;
        answer.await.map_err(|_| ClientError::ChannelClosed)?
    }

    async fn open(&self, name: &str) -> Result<ChannelInfo, ClientError> {
        let name = name.to_owned();
        self.request(|reply| CircuitRequest::Open { name, reply })
            .await
    }

    async fn read(&self, cid: u32, count: u32) -> Result<Dbr, ClientError> {
        self.request(|reply| CircuitRequest::Read { cid, count, reply })
            .await
    }
}

impl Drop for Circuit {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Exchange versions and identify ourselves to a freshly connected server
async fn handshake<W: AsyncWrite + Unpin>(
    incoming: &mut ServerStream,
    outgoing: &mut W,
    client_name: &str,
    host_name: &str,
) -> Result<(), ClientError> {
    Message::write_all_messages(
        &[
            messages::Version::default().into(),
            messages::ClientName::new(client_name).into(),
            messages::HostName::new(host_name).into(),
        ],
        outgoing,
    )
    .await?;
    match incoming.next().await {
        Some(Ok(Message::Version(version))) if version.is_compatible() => Ok(()),
        Some(Ok(Message::Version(version))) => Err(ClientError::ServerVersionMismatch(
            version.protocol_version,
        )),
        Some(Ok(other)) => {
            debug!("Expected VERSION from server, got {other:?}");
            Err(ClientError::ServerSentInvalidMessage)
        }
        Some(Err(e)) => {
            debug!("Could not decode server handshake: {e}");
            Err(ClientError::ServerSentInvalidMessage)
        }
        None => Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
    }
}

/// What is known about an open channel
#[derive(Debug, Clone, Copy)]
struct ChannelInfo {
    cid: u32,
    native_type: DbrBasicType,
    native_count: u32,
}

enum ChannelState {
    /// CREATE_CHAN sent, with everyone waiting for the reply
    Creating(Vec<Reply<ChannelInfo>>),
    Open { info: ChannelInfo, sid: u32 },
}

struct Channel {
    name: String,
    access: Access,
    state: ChannelState,
}

/// Echo timing: a circuit idle for a while is sent an echo, and declared dead if
/// it goes unanswered for as long again
struct Keepalive {
    period: Duration,
    deadline: Instant,
    awaiting_echo: bool,
}

impl Keepalive {
    fn new(period: Duration) -> Self {
        Keepalive {
            period,
            deadline: Instant::now() + period,
            awaiting_echo: false,
        }
    }

    fn heard_from_server(&mut self) {
        self.awaiting_echo = false;
        self.deadline = Instant::now() + self.period;
    }

    /// The deadline passed. Returns false if the server is presumed dead.
    fn echo_due(&mut self) -> bool {
        if self.awaiting_echo {
            return false;
        }
        self.awaiting_echo = true;
        self.deadline = Instant::now() + self.period;
        true
    }
}

struct CircuitTask {
    address: SocketAddr,
    requests: mpsc::Receiver<CircuitRequest>,
    cancel: CancellationToken,
    next_cid: u32,
    next_ioid: u32,
    channels: HashMap<u32, Channel>,
    /// Channel ID for each channel name
    cids: HashMap<String, u32>,
    /// Outstanding ReadNotify requests by IOID, and the channel they are for
    reads: HashMap<u32, (u32, Reply<Dbr>)>,
    keepalive: Keepalive,
}

impl CircuitTask {
    async fn run<W: AsyncWrite + Unpin>(mut self, mut incoming: ServerStream, mut outgoing: W) {
        debug!("Circuit to {} ready", self.address);
        loop {
            let outbound = select! {
                _ = self.cancel.cancelled() => break,
                message = incoming.next() => match message {
                    Some(Ok(message)) => {
                        self.keepalive.heard_from_server();
                        self.handle_message(message)
                    }
                    Some(Err(e)) => {
                        error!("Could not decode message from {}, closing circuit: {e}", self.address);
                        break;
                    }
                    None => {
                        debug!("{} closed the circuit", self.address);
                        break;
                    }
                },
                request = self.requests.recv() => match request {
                    Some(request) => self.handle_request(request),
                    None => break,
                },
                _ = sleep_until(self.keepalive.deadline.into()) => {
                    if !self.keepalive.echo_due() {
                        error!("No echo from {}, closing circuit", self.address);
                        break;
                    }
                    vec![Message::Echo]
                },
            };
            if outbound.is_empty() {
                continue;
            }
            trace!("Sending {outbound:?}");
            if let Err(e) = Message::write_all_messages(&outbound, &mut outgoing).await {
                error!("Could not write to {}, closing circuit: {e}", self.address);
                break;
            }
        }
        self.cancel.cancel();
        for cid in self.channels.keys().copied().collect::<Vec<_>>() {
            self.drop_channel(cid, || ClientError::ChannelClosed);
        }
        for (_, (_, reply)) in self.reads.drain() {
            let _ = reply.send(Err(ClientError::ChannelClosed));
        }
        let _ = outgoing.shutdown().await;
    }

    fn handle_request(&mut self, request: CircuitRequest) -> Vec<Message> {
        match request {
            CircuitRequest::Open { name, reply } => {
                if let Some(channel) = self.cids.get(&name).and_then(|c| self.channels.get_mut(c)) {
                    match &mut channel.state {
                        ChannelState::Open { info, .. } => {
                            let _ = reply.send(Ok(*info));
                        }
                        ChannelState::Creating(waiting) => waiting.push(reply),
                    }
                    return Vec::new();
                }
                let cid = wrapping_inplace_add(&mut self.next_cid);
                debug!("Creating channel {cid} for {name}");
                self.cids.insert(name.clone(), cid);
                self.channels.insert(
                    cid,
                    Channel {
                        name: name.clone(),
                        access: Access::None,
                        state: ChannelState::Creating(vec![reply]),
                    },
                );
                vec![
                    messages::CreateChannel {
                        client_id: cid,
                        channel_name: name,
                        ..Default::default()
                    }
                    .into(),
                ]
            }
            CircuitRequest::Read { cid, count, reply } => {
                let (info, sid) = match self.channels.get(&cid) {
                    Some(Channel {
                        state: ChannelState::Open { info, sid },
                        access,
                        ..
                    }) if access.can_read() => (*info, *sid),
                    Some(Channel {
                        state: ChannelState::Open { .. },
                        ..
                    }) => {
                        let _ = reply.send(Err(ClientError::NoReadAccess));
                        return Vec::new();
                    }
                    _ => {
                        let _ = reply.send(Err(ClientError::ChannelClosed));
                        return Vec::new();
                    }
                };
                let ioid = wrapping_inplace_add(&mut self.next_ioid);
                trace!("Read {ioid} of {count} from channel {cid}");
                self.reads.insert(ioid, (cid, reply));
                vec![
                    messages::ReadNotify {
                        data_type: DbrType::new(info.native_type, DbrCategory::Time),
                        data_count: count,
                        server_id: sid,
                        client_ioid: ioid,
                    }
                    .into(),
                ]
            }
        }
    }

    /// Forget a channel, failing everything still waiting on it
    fn drop_channel(&mut self, cid: u32, error: impl Fn() -> ClientError) {
        if let Some(channel) = self.channels.remove(&cid) {
            self.cids.remove(&channel.name);
            if let ChannelState::Creating(waiting) = channel.state {
                for reply in waiting {
                    let _ = reply.send(Err(error()));
                }
            }
        }
        let ioids: Vec<u32> = self
            .reads
            .iter()
            .filter_map(|(ioid, (read_cid, _))| (*read_cid == cid).then_some(*ioid))
            .collect();
        for ioid in ioids {
            if let Some((_, reply)) = self.reads.remove(&ioid) {
                let _ = reply.send(Err(error()));
            }
        }
    }

    fn handle_message(&mut self, message: Message) -> Vec<Message> {
        trace!("Received {message:?}");
        match message {
            Message::AccessRights(msg) => match self.channels.get_mut(&msg.client_id) {
                Some(channel) => {
                    debug!("{} access is now {}", channel.name, msg.access_rights);
                    channel.access = msg.access_rights;
                }
                None => debug!("Access rights for unknown channel {}", msg.client_id),
            },
            Message::CreateChannelResponse(msg) => {
                let Some(channel) = self.channels.get_mut(&msg.client_id) else {
                    debug!("Creation reply for unknown channel {}", msg.client_id);
                    return Vec::new();
                };
                let info = ChannelInfo {
                    cid: msg.client_id,
                    native_type: msg.data_type,
                    native_count: msg.data_count,
                };
                let previous = std::mem::replace(
                    &mut channel.state,
                    ChannelState::Open {
                        info,
                        sid: msg.server_id,
                    },
                );
                if let ChannelState::Creating(waiting) = previous {
                    for reply in waiting {
                        let _ = reply.send(Ok(info));
                    }
                }
            }
            Message::CreateChannelFailure(msg) => {
                warn!("Server refused to create channel {}", msg.client_id);
                self.drop_channel(msg.client_id, || ClientError::ChannelCreateFailed);
            }
            Message::ServerDisconnect(msg) => {
                debug!("Server dropped channel {}", msg.client_id);
                self.drop_channel(msg.client_id, || ClientError::ChannelClosed);
            }
            Message::ReadNotifyResponse(msg) => {
                let Some((_, reply)) = self.reads.remove(&msg.client_ioid) else {
                    warn!("Read response for unknown request {}", msg.client_ioid);
                    return Vec::new();
                };
                let result = if msg.is_success() {
                    Dbr::from_bytes(msg.data_type, msg.data_count as usize, &msg.data)
                        .map_err(|_| ClientError::ServerSentInvalidMessage)
                } else {
                    Err(ClientError::from_status(msg.status_code, String::new()))
                };
                let _ = reply.send(result);
            }
            Message::ECAError(msg) => {
                let request = &msg.original_request;
                warn!(
                    "Server error in reply to command {}: {}",
                    request.command, msg.error_message
                );
                if request.command == CA_PROTO_READ_NOTIFY {
                    if let Some((_, reply)) = self.reads.remove(&request.field_4_parameter_2) {
                        let _ = reply.send(Err(ClientError::from_status(
                            msg.status_code,
                            msg.error_message,
                        )));
                    }
                } else if request.command == CA_PROTO_CREATE_CHAN {
                    self.drop_channel(request.field_3_parameter_1, || {
                        ClientError::ChannelCreateFailed
                    });
                }
            }
            Message::Echo => (),
            other => debug!("Ignoring {other:?}"),
        }
        Vec::new()
    }
}

/// Handle to a connected channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PvChannel {
    name: String,
    server: SocketAddr,
    cid: u32,
    native_type: DbrBasicType,
    native_count: u32,
}

impl PvChannel {
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn server(&self) -> SocketAddr {
        self.server
    }
    pub fn native_type(&self) -> DbrBasicType {
        self.native_type
    }
    pub fn native_count(&self) -> u32 {
        self.native_count
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("{0}")]
    IO(#[from] io::Error),
    #[error("{0}")]
    PVNotFoundError(#[from] CouldNotFindError),
    #[error("Server sent a message that could not be understood")]
    ServerSentInvalidMessage,
    #[error("Server speaks incompatible protocol version {0}")]
    ServerVersionMismatch(u16),
    #[error("Client has been stopped")]
    ClientClosed,
    #[error("Channel is closed")]
    ChannelClosed,
    #[error("Channel is disconnected, searching for it again")]
    Disconnected,
    #[error("Server could not create the channel")]
    ChannelCreateFailed,
    #[error("No read access to channel")]
    NoReadAccess,
    #[error("Timed out")]
    Timeout,
    #[error("Server error: {0} {1}")]
    ServerError(ErrorCondition, String),
    #[error("Server returned unknown status code {0}")]
    UnknownStatus(u32),
    #[error("Could not convert value: {0}")]
    Conversion(ErrorCondition),
}

impl ClientError {
    fn from_status(code: u32, message: String) -> Self {
        match ErrorCondition::from_code(code) {
            Some(condition) => ClientError::ServerError(condition, message),
            None => ClientError::UnknownStatus(code),
        }
    }
}

impl From<tokio::time::error::Elapsed> for ClientError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ClientError::Timeout
    }
}

/// Channel Access client, holding one circuit per server
pub struct Client {
    circuits: HashMap<SocketAddr, Circuit>,
    cancellation: CancellationToken,
    searcher: Searcher,
    /// Searches for channels whose circuit died or that the server dropped
    lost: HashMap<String, PendingSearch>,
    client_name: String,
    host_name: String,
    echo_period: Duration,
}

impl Client {
    /// Start a client searching on `search_port`, or on explicit addresses
    pub async fn new_with(
        search_port: u16,
        broadcast_addresses: Option<Vec<SocketAddr>>,
    ) -> Result<Client, ClientError> {
        let cancellation = CancellationToken::new();
        let mut builder = SearcherBuilder::new()
            .search_port(search_port)
            .timeout(None)
            .stop_token(cancellation.clone());
        if let Some(addresses) = broadcast_addresses {
            builder = builder.broadcast_to(addresses);
        }
        let searcher = builder.start().await?;

        let client_name = whoami::username();
        let host_name = whoami::fallible::hostname().unwrap_or_else(|_| client_name.clone());
        Ok(Client {
            circuits: HashMap::new(),
            cancellation,
            searcher,
            lost: HashMap::new(),
            client_name,
            host_name,
            echo_period: Duration::from_secs_f32(get_default_connection_timeout() / 2.0),
        })
    }

    /// The live circuit to a server, connecting a new one if needed
    async fn circuit_to(&mut self, server: SocketAddr) -> Result<&Circuit, ClientError> {
        if self.circuits.get(&server).is_some_and(|c| !c.is_alive()) {
            debug!("Circuit to {server} has closed");
            self.circuits.remove(&server);
        }
        if !self.circuits.contains_key(&server) {
            let circuit = Circuit::connect(
                server,
                &self.client_name,
                &self.host_name,
                self.echo_period,
                &self.cancellation,
            )
            .await?;
            self.circuits.insert(server, circuit);
        }
        self.circuits.get(&server).ok_or(ClientError::ClientClosed)
    }

    async fn open_on(&mut self, name: &str, server: SocketAddr) -> Result<PvChannel, ClientError> {
        let info = self.circuit_to(server).await?.open(name).await?;
        debug!("Opened {name} on {server}: {info:?}");
        Ok(PvChannel {
            name: name.to_owned(),
            server,
            cid: info.cid,
            native_type: info.native_type,
            native_count: info.native_count,
        })
    }

    /// Search for a PV and create a channel to it, failing after `timeout`
    pub async fn connect_channel(
        &mut self,
        name: &str,
        timeout: Duration,
    ) -> Result<PvChannel, ClientError> {
        tokio::time::timeout(timeout, async {
            let server = self.searcher.search_for(name).await?;
            self.open_on(name, server).await
        })
        .await?
    }

    fn is_connected(&self, channel: &PvChannel) -> bool {
        !self.lost.contains_key(&channel.name)
            && self
                .circuits
                .get(&channel.server)
                .is_some_and(Circuit::is_alive)
    }

    /// Recreate a lost channel once the search for it has found a server
    ///
    /// The first call for a channel waits briefly for the search. Later calls
    /// fail with [`ClientError::Disconnected`] until the search has finished.
    async fn reconnect(&mut self, channel: &mut PvChannel) -> Result<(), ClientError> {
        if self.cancellation.is_cancelled() {
            return Err(ClientError::ClientClosed);
        }
        let found = match self.lost.get_mut(&channel.name) {
            Some(search) => search.poll(),
            None => {
                debug!("Lost {}, searching for it again", channel.name);
                let mut search = self.searcher.begin(&channel.name).await?;
                let found = tokio::time::timeout(RECONNECT_GRACE, search.wait())
                    .await
                    .ok();
                if found.is_none() {
                    self.lost.insert(channel.name.clone(), search);
                }
                found
            }
        };
        let server = found.ok_or(ClientError::Disconnected)?;
        self.lost.remove(&channel.name);
        *channel = self.open_on(&channel.name, server?).await?;
        Ok(())
    }

    async fn circuit_read(&self, channel: &PvChannel, count: u32) -> Result<Dbr, ClientError> {
        match self.circuits.get(&channel.server) {
            Some(circuit) => circuit.read(channel.cid, count).await,
            None => Err(ClientError::ChannelClosed),
        }
    }

    /// Read the full value and metadata of a connected channel
    ///
    /// A channel whose circuit has died, or that the server has dropped, is
    /// searched for again in the background. Until a server is found, reads of
    /// it fail straight away with [`ClientError::Disconnected`]; after that the
    /// channel is recreated within the read's timeout.
    pub async fn read_dbr(
        &mut self,
        channel: &mut PvChannel,
        count: u32,
        timeout: Duration,
    ) -> Result<Dbr, ClientError> {
        tokio::time::timeout(timeout, async {
            if !self.is_connected(channel) {
                self.reconnect(channel).await?;
            }
            match self.circuit_read(channel, count).await {
                Err(ClientError::ChannelClosed) => {
                    debug!("{} was closed by {}", channel.name, channel.server);
                    self.reconnect(channel).await?;
                    self.circuit_read(channel, count).await
                }
                result => result,
            }
        })
        .await?
    }

    /// Read the first element of a channel, converted to `T`
    pub async fn read<T>(&mut self, channel: &mut PvChannel, timeout: Duration) -> Result<T, ClientError>
    where
        T: for<'a> TryFrom<&'a DbrValue, Error = ErrorCondition>,
    {
        let dbr = self.read_dbr(channel, 1, timeout).await?;
        T::try_from(dbr.value()).map_err(ClientError::Conversion)
    }

    pub fn stop(&self) {
        self.cancellation.cancel();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.cancellation.cancel();
    }
}
