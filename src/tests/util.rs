use super::*;

pub(super) fn subscribe() -> tracing::subscriber::DefaultGuard {
    let sub = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .finish();
    tracing::subscriber::set_default(sub)
}

/// A client and server transport wired back to back through byte vectors
pub(super) struct Pair {
    pub client: Transport,
    pub server: Transport,
}

impl Pair {
    pub(super) fn new(client_config: TransportConfig, server_config: TransportConfig) -> Self {
        let mut client = Transport::new(client_config);
        client.bind(Connection::new("client"));
        let mut server = Transport::new(server_config);
        server.bind(Connection::new("server"));
        Self { client, server }
    }

    /// Shuttle bytes both ways until neither side has anything left to say
    pub(super) fn drive(&mut self) {
        loop {
            let moved = shuttle(&mut self.client, &mut self.server)
                + shuttle(&mut self.server, &mut self.client);
            if moved == 0 {
                break;
            }
        }
    }

    pub(super) fn client_conn(&mut self) -> &mut Connection {
        self.client.connection_mut().unwrap()
    }

    pub(super) fn server_conn(&mut self) -> &mut Connection {
        self.server.connection_mut().unwrap()
    }

    /// Open both connections and complete the Open handshake
    pub(super) fn connect(&mut self) {
        self.client_conn().open();
        self.server_conn().open();
        self.drive();
        assert_eq!(self.client_conn().remote_state(), EndpointState::Active);
        assert_eq!(self.server_conn().remote_state(), EndpointState::Active);
    }

    /// Establish a sender link from client to server with `credit` granted
    pub(super) fn sender_link(&mut self, credit: u32) -> (LinkHandle, LinkHandle) {
        self.connect();
        let session = self.client_conn().begin().unwrap();
        let sender = self
            .client_conn()
            .attach(session, "data", Role::Sender, None, Some(Target::default()))
            .unwrap();
        self.drive();

        let mirrored = self.server_conn().sessions().next().unwrap();
        self.server_conn().accept(mirrored).unwrap();
        let receiver = self
            .server_conn()
            .attach(mirrored, "data", Role::Receiver, None, None)
            .unwrap();
        self.server_conn().flow(receiver, credit).unwrap();
        self.drive();
        assert_eq!(self.client_conn().link_credit(sender), Some(credit));
        (sender, receiver)
    }
}

impl Default for Pair {
    fn default() -> Self {
        Self::new(TransportConfig::default(), TransportConfig::default())
    }
}

fn shuttle(from: &mut Transport, to: &mut Transport) -> usize {
    let n = from.pending();
    if n == 0 {
        return 0;
    }
    let bytes = from.head().to_vec();
    from.pop(n);
    let _ = to.input(&bytes);
    n
}

/// Drain everything queued and decode it, skipping protocol headers
pub(super) fn drain_frames(transport: &mut Transport) -> Vec<Frame> {
    let mut bytes = Vec::new();
    loop {
        let n = transport.pending();
        if n == 0 {
            break;
        }
        bytes.extend_from_slice(transport.head());
        transport.pop(n);
    }
    let mut frames = Vec::new();
    let mut buf = &bytes[..];
    while !buf.is_empty() {
        if buf.len() >= 8 && buf[..4] == *b"AMQP" {
            buf = &buf[8..];
            continue;
        }
        match frame::decode(buf, u32::MAX).unwrap() {
            Some((decoded, consumed)) => {
                frames.push(decoded);
                buf = &buf[consumed..];
            }
            None => panic!("truncated frame in drained output"),
        }
    }
    frames
}
