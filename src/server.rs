//! Single-threaded broker server.
//!
//! One mio `Poll` multiplexes the listener and every session socket on
//! the calling thread. The session table and subscription index are owned
//! by the loop, so no locking is needed anywhere: accept, decode,
//! dispatch, and fan-out all run serialized on one thread.

use std::io;
use std::str;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ahash::AHashMap;
use log::{debug, info, warn};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};

use crate::client::{Client, ClientState, Frame};
use crate::config::Config;
use crate::error::Result;
use crate::packet::{self, Connect, Packet, Publish, QoS, Suback, Subscribe};
use crate::subscription::SubscriptionStore;
use crate::util::to_hex;

/// Token for the listener socket.
const LISTENER: Token = Token(0);

/// First token handed to client sessions.
const CLIENT_START: usize = 1;

/// Readiness-wait tick; also how often the stop flag is consulted.
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Stack buffer size for a single socket read.
const READ_CHUNK: usize = 2048;

/// Human-readable packet name for log lines.
fn packet_name(packet: &Packet) -> &'static str {
    match packet {
        Packet::Connect(_) => "CONNECT",
        Packet::Connack => "CONNACK",
        Packet::Publish(_) => "PUBLISH",
        Packet::Puback { .. } => "PUBACK",
        Packet::Subscribe(_) => "SUBSCRIBE",
        Packet::Suback(_) => "SUBACK",
        Packet::Pingreq => "PINGREQ",
        Packet::Pingresp => "PINGRESP",
        Packet::Disconnect => "DISCONNECT",
        Packet::Unknown { .. } => "UNKNOWN",
    }
}

/// MQTT debug broker server.
pub struct Server {
    poll: Poll,
    listener: TcpListener,
    /// Sessions by token. Exclusive to the loop thread.
    clients: AHashMap<Token, Client>,
    /// Topic -> subscriber index. Exclusive to the loop thread.
    subscriptions: SubscriptionStore,
    /// Next token for new sessions.
    next_token: usize,
    config: Config,
    /// Set from the signal handler; consulted once per tick.
    stop: Arc<AtomicBool>,
}

impl Server {
    /// Bind the listener and set up the poller.
    pub fn new(config: Config) -> Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(config.bind)?;

        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        info!("mqpeek listening on {}", listener.local_addr()?);

        Ok(Self {
            poll,
            listener,
            clients: AHashMap::new(),
            subscriptions: SubscriptionStore::new(),
            next_token: CLIENT_START,
            config,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Flag that stops the loop when set. Hand this to the signal handler.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Run until the stop flag is set, then close every session socket
    /// and the listener.
    pub fn run(&mut self) -> Result<()> {
        while !self.stop.load(Ordering::Relaxed) {
            self.run_once()?;
        }
        self.shutdown();
        Ok(())
    }

    /// One tick: wait up to a second for readiness, service every ready
    /// socket, then tear down sessions marked Disconnecting.
    pub fn run_once(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(1024);

        if let Err(e) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
            // A signal landing mid-poll is not an error; the loop condition
            // notices the stop flag.
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(e.into());
        }

        for event in events.iter() {
            let token = event.token();
            if token == LISTENER {
                self.accept_connections()?;
                continue;
            }
            if event.is_readable() {
                self.handle_readable(token);
            }
            if event.is_writable() {
                self.handle_writable(token);
            }
        }

        self.cleanup_clients();
        Ok(())
    }

    /// Accept pending connections, closing them immediately once the
    /// session table is full.
    fn accept_connections(&mut self) -> Result<()> {
        loop {
            match self.listener.accept() {
                Ok((mut socket, addr)) => {
                    if self.clients.len() >= self.config.max_clients {
                        warn!(
                            "rejecting {}: {} sessions already connected",
                            addr,
                            self.clients.len()
                        );
                        continue; // dropping the socket closes it
                    }

                    let token = Token(self.next_token);
                    self.next_token += 1;

                    self.poll
                        .registry()
                        .register(&mut socket, token, Interest::READABLE)?;

                    let client = Client::new(socket, addr);
                    info!("[{}] accepted connection", client.client_id);
                    self.clients.insert(token, client);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn handle_readable(&mut self, token: Token) {
        let mut scratch = [0u8; READ_CHUNK];

        let peer_closed = {
            let Some(client) = self.clients.get_mut(&token) else {
                return;
            };
            match client.read(&mut scratch) {
                Ok(closed) => closed,
                Err(e) => {
                    warn!("[{}] read error: {}", client.client_id, e);
                    client.state = ClientState::Disconnecting;
                    return;
                }
            }
        };

        // Process whatever arrived, even if the peer closed right after
        // writing (a client may send DISCONNECT and hang up in one go).
        self.process_inbox(token);

        if peer_closed {
            if let Some(client) = self.clients.get_mut(&token) {
                if client.state != ClientState::Disconnecting {
                    info!("[{}] connection closed by peer", client.client_id);
                    client.state = ClientState::Disconnecting;
                }
            }
        }

        self.update_write_interest(token);
    }

    fn handle_writable(&mut self, token: Token) {
        {
            let Some(client) = self.clients.get_mut(&token) else {
                return;
            };
            if let Err(e) = client.flush() {
                warn!("[{}] write failed: {}", client.client_id, e);
                client.state = ClientState::Disconnecting;
                return;
            }
        }
        self.update_write_interest(token);
    }

    /// Extract and dispatch every complete frame buffered for a session.
    fn process_inbox(&mut self, token: Token) {
        loop {
            let frame = {
                let Some(client) = self.clients.get_mut(&token) else {
                    return;
                };
                if client.state == ClientState::Disconnecting {
                    return;
                }
                match client.inbox.next_frame() {
                    Ok(Some(frame)) => frame,
                    Ok(None) => return,
                    Err(e) => {
                        // The length encoding itself is broken, so the next
                        // packet boundary is unknowable. Drop the buffered
                        // bytes and let the client resynchronize.
                        warn!("[{}] malformed frame: {}", client.client_id, e);
                        client.inbox.clear();
                        if self.config.disconnect_on_error {
                            client.state = ClientState::Disconnecting;
                        }
                        return;
                    }
                }
            };

            self.handle_frame(token, frame);
        }
    }

    fn handle_frame(&mut self, token: Token, frame: Frame) {
        if self.config.log_raw {
            if let Some(client) = self.clients.get(&token) {
                info!(
                    "[{}] <= type={} raw: {}",
                    client.client_id,
                    frame.packet_type(),
                    to_hex(frame.bytes())
                );
            }
        }

        let packet = match frame.decode() {
            Ok(packet) => packet,
            Err(e) => {
                let Some(client) = self.clients.get_mut(&token) else {
                    return;
                };
                // The frame bytes are already consumed, so under the
                // permissive policy the session just skips this packet.
                warn!(
                    "[{}] malformed type-{} packet: {}",
                    client.client_id,
                    frame.packet_type(),
                    e
                );
                if self.config.disconnect_on_error {
                    client.state = ClientState::Disconnecting;
                }
                return;
            }
        };

        if let Some(client) = self.clients.get(&token) {
            if client.state == ClientState::Connecting && !matches!(packet, Packet::Connect(_)) {
                warn!(
                    "[{}] {} before CONNECT",
                    client.client_id,
                    packet_name(&packet)
                );
            }
        }

        match packet {
            Packet::Connect(connect) => self.handle_connect(token, connect),
            Packet::Publish(publish) => self.handle_publish(token, publish),
            Packet::Subscribe(subscribe) => self.handle_subscribe(token, subscribe),
            Packet::Pingreq => self.handle_pingreq(token),
            Packet::Disconnect => {
                if let Some(client) = self.clients.get_mut(&token) {
                    info!("[{}] DISCONNECT", client.client_id);
                    client.state = ClientState::Disconnecting;
                }
            }
            Packet::Unknown { packet_type } => {
                if let Some(client) = self.clients.get_mut(&token) {
                    warn!(
                        "[{}] unsupported packet type {}",
                        client.client_id, packet_type
                    );
                    if self.config.disconnect_on_error {
                        client.state = ClientState::Disconnecting;
                    }
                }
            }
            // Broker-to-client packets; decode_body never produces these.
            _ => {}
        }
    }

    /// CONNECT is tolerated at any time: a repeat updates the client id
    /// and earns a fresh CONNACK.
    fn handle_connect(&mut self, token: Token, connect: Connect) {
        let Some(client) = self.clients.get_mut(&token) else {
            return;
        };

        if !connect.client_id.is_empty() {
            client.client_id = connect.client_id;
        }
        info!(
            "[{}] CONNECT proto={} level={} keep_alive={}s flags={:#04x}",
            client.client_id,
            connect.protocol_name,
            connect.protocol_level,
            connect.keep_alive,
            connect.connect_flags
        );

        // Blocks the whole loop while sleeping; the switch exists to
        // exercise client-side connect timeouts.
        if !self.config.connect_delay.is_zero() {
            thread::sleep(self.config.connect_delay);
        }

        Self::send_to(client, &Packet::Connack);
        if client.state != ClientState::Disconnecting {
            client.state = ClientState::Connected;
        }
        self.update_write_interest(token);
    }

    fn handle_publish(&mut self, token: Token, publish: Publish) {
        // Acknowledge QoS 1/2 up front with the client's packet id;
        // delivery is best-effort either way and nothing is retransmitted.
        if let Some(packet_id) = publish.packet_id {
            if let Some(client) = self.clients.get_mut(&token) {
                Self::send_to(client, &Packet::Puback { packet_id });
            }
            self.update_write_interest(token);
        }

        if let Some(client) = self.clients.get(&token) {
            if self.config.log_payload {
                info!(
                    "[{}] PUBLISH topic='{}' payload='{}'",
                    client.client_id,
                    String::from_utf8_lossy(&publish.topic),
                    String::from_utf8_lossy(&publish.payload)
                );
            } else {
                info!(
                    "[{}] PUBLISH topic='{}' ({} bytes)",
                    client.client_id,
                    String::from_utf8_lossy(&publish.topic),
                    publish.payload.len()
                );
            }
        }

        // Forwarded publications are always QoS 0, whatever came in.
        let outgoing = Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: publish.topic.clone(),
            packet_id: None,
            payload: publish.payload.clone(),
        };
        let mut bytes = Vec::new();
        if packet::encode_packet(&Packet::Publish(outgoing), &mut bytes).is_err() {
            return;
        }

        // Subscriptions are keyed by UTF-8 strings; a topic that is not
        // valid UTF-8 cannot have been subscribed to.
        let Ok(topic) = str::from_utf8(&publish.topic) else {
            return;
        };

        let reflect = self.config.reflect;
        let recipients: Vec<Token> = self
            .subscriptions
            .subscribers(topic)
            .iter()
            .copied()
            .filter(|t| reflect || *t != token)
            .collect();

        for recipient in recipients {
            if let Some(subscriber) = self.clients.get_mut(&recipient) {
                if subscriber.state == ClientState::Disconnecting {
                    continue;
                }
                if let Err(e) = subscriber.send(&bytes) {
                    warn!("[{}] forward failed: {}", subscriber.client_id, e);
                    subscriber.state = ClientState::Disconnecting;
                } else {
                    debug!("[{}] => PUBLISH topic='{}'", subscriber.client_id, topic);
                }
            }
            self.update_write_interest(recipient);
        }
    }

    fn handle_subscribe(&mut self, token: Token, subscribe: Subscribe) {
        let Some(client) = self.clients.get_mut(&token) else {
            return;
        };

        let mut return_codes = Vec::with_capacity(subscribe.topics.len());
        for (topic, qos) in &subscribe.topics {
            self.subscriptions.subscribe(topic, token);
            client.subscriptions.insert(topic.clone());
            info!(
                "[{}] subscribed to '{}' qos={}",
                client.client_id, topic, *qos as u8
            );
            // Everything is granted, always at QoS 0.
            return_codes.push(0x00);
        }

        Self::send_to(
            client,
            &Packet::Suback(Suback {
                packet_id: subscribe.packet_id,
                return_codes,
            }),
        );
        self.update_write_interest(token);
    }

    fn handle_pingreq(&mut self, token: Token) {
        let Some(client) = self.clients.get_mut(&token) else {
            return;
        };
        debug!("[{}] PINGREQ", client.client_id);
        Self::send_to(client, &Packet::Pingresp);
        self.update_write_interest(token);
    }

    /// Send a packet, marking the session Disconnecting on any failure.
    fn send_to(client: &mut Client, packet: &Packet) {
        if let Err(e) = client.send_packet(packet) {
            warn!("[{}] write failed: {}", client.client_id, e);
            client.state = ClientState::Disconnecting;
        }
    }

    /// Enable WRITABLE interest while a session has unflushed bytes.
    fn update_write_interest(&mut self, token: Token) {
        let registry = self.poll.registry();
        let Some(client) = self.clients.get_mut(&token) else {
            return;
        };

        let interest = if client.has_pending_write() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        if registry
            .reregister(&mut client.socket, token, interest)
            .is_err()
        {
            client.state = ClientState::Disconnecting;
        }
    }

    /// Tear down every session marked Disconnecting: deregister, drop its
    /// subscription edges, close the socket.
    fn cleanup_clients(&mut self) {
        let finished: Vec<Token> = self
            .clients
            .iter()
            .filter(|(_, client)| client.state == ClientState::Disconnecting)
            .map(|(token, _)| *token)
            .collect();

        for token in finished {
            if let Some(mut client) = self.clients.remove(&token) {
                let _ = self.poll.registry().deregister(&mut client.socket);
                self.subscriptions.remove_client(token);
                info!("[{}] session closed", client.client_id);
            }
        }
    }

    /// Close every session socket, then the listener.
    fn shutdown(&mut self) {
        info!("shutting down, closing {} session(s)", self.clients.len());
        for (_, mut client) in self.clients.drain() {
            let _ = self.poll.registry().deregister(&mut client.socket);
        }
        let _ = self.poll.registry().deregister(&mut self.listener);
        info!("server stopped");
    }
}
