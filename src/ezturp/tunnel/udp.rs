pub mod client;
pub mod server;

/// Receive buffer size for every UDP socket of a tunnel.
pub const MAX_DATAGRAM: usize = 64 * 1024;

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, sync::Arc, time::Duration};

    use tokio::{net::UdpSocket, sync::watch, time::timeout};

    use super::{client::UdpClient, server::UdpServer};
    use crate::ezturp::{
        config::Settings,
        tunnel::{
            ClientOptions, ServerOptions, TunnelError,
            protocol::{FrameType, encode_frame, parse_frame},
        },
    };

    const WAIT: Duration = Duration::from_secs(5);

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        timeout(WAIT, async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    /// Local service answering every datagram with `echo:` + payload.
    async fn spawn_echo() -> SocketAddr {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = sock.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                let Ok((n, from)) = sock.recv_from(&mut buf).await else { return };
                let mut reply = b"echo:".to_vec();
                reply.extend_from_slice(&buf[..n]);
                let _ = sock.send_to(&reply, from).await;
            }
        });
        addr
    }

    struct RunningServer {
        server: Arc<UdpServer>,
        internal: SocketAddr,
        external: SocketAddr,
        _stop: watch::Sender<bool>,
    }

    async fn start_server() -> RunningServer {
        let internal_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let external_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let internal = internal_sock.local_addr().unwrap();
        let external = external_sock.local_addr().unwrap();
        let server = Arc::new(UdpServer::new(ServerOptions {
            name: "test".into(),
            internal_addr: internal.to_string(),
            external_addr: external.to_string(),
            settings: Settings::default(),
        }));
        let (stop, rx) = watch::channel(false);
        let s = server.clone();
        tokio::spawn(async move { s.serve(internal_sock, external_sock, rx).await });
        RunningServer {
            server,
            internal,
            external,
            _stop: stop,
        }
    }

    fn start_client(
        local: SocketAddr,
        internal: SocketAddr,
        settings: Settings,
    ) -> (Arc<UdpClient>, watch::Sender<bool>) {
        let client = Arc::new(UdpClient::new(ClientOptions {
            name: "test".into(),
            local_addr: local.to_string(),
            internal_addr: internal.to_string(),
            settings,
        }));
        let (stop, rx) = watch::channel(false);
        let c = client.clone();
        tokio::spawn(async move { c.connect(rx).await });
        (client, stop)
    }

    async fn roundtrip(user: &UdpSocket, to: SocketAddr, msg: &[u8]) -> Vec<u8> {
        user.send_to(msg, to).await.unwrap();
        let mut buf = vec![0u8; 2048];
        let (n, from) = timeout(WAIT, user.recv_from(&mut buf)).await.unwrap().unwrap();
        assert_eq!(from, to);
        buf.truncate(n);
        buf
    }

    #[tokio::test]
    async fn datagrams_flow_both_ways_per_user() {
        let echo = spawn_echo().await;
        let rs = start_server().await;
        let (client, _stop) = start_client(echo, rs.internal, Settings::default());
        let server = rs.server.clone();
        wait_until(|| server.client_addr().is_some()).await;

        let alice = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let bob = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        assert_eq!(roundtrip(&alice, rs.external, b"from alice").await, b"echo:from alice");
        assert_eq!(roundtrip(&bob, rs.external, b"from bob").await, b"echo:from bob");
        assert_eq!(roundtrip(&alice, rs.external, b"again").await, b"echo:again");

        assert_eq!(rs.server.session_count(), 2);
        assert_eq!(client.session_count(), 2);
    }

    #[tokio::test]
    async fn external_datagrams_dropped_until_client_known() {
        let rs = start_server().await;
        let user = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        user.send_to(b"too early", rs.external).await.unwrap();

        // The session is recorded even though nothing could be forwarded.
        let server = rs.server.clone();
        wait_until(|| server.session_count() == 1).await;
        assert!(rs.server.client_addr().is_none());

        // A hand-rolled client learns the id of that user from the next datagram.
        let fake = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let hello = encode_frame(FrameType::MaintainUdpClientAddr, 0, &[]).unwrap();
        fake.send_to(&hello, rs.internal).await.unwrap();
        wait_until(|| server.client_addr() == Some(fake.local_addr().unwrap())).await;

        user.send_to(b"now", rs.external).await.unwrap();
        let mut buf = vec![0u8; 2048];
        let n = timeout(WAIT, fake.recv(&mut buf)).await.unwrap().unwrap();
        let frame = parse_frame(&buf[..n]).unwrap();
        assert_eq!(frame.kind, FrameType::Data);
        assert_eq!(&frame.payload[..], b"now");

        // Malformed datagrams and unknown ids are dropped without stopping the server.
        fake.send_to(b"garbage", rs.internal).await.unwrap();
        let ghost = encode_frame(FrameType::Data, frame.session_id.wrapping_add(1), b"x").unwrap();
        fake.send_to(&ghost, rs.internal).await.unwrap();

        let reply = encode_frame(FrameType::Data, frame.session_id, b"reply").unwrap();
        fake.send_to(&reply, rs.internal).await.unwrap();
        let n = timeout(WAIT, user.recv(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"reply");
    }

    #[tokio::test]
    async fn client_address_follows_the_latest_heartbeat() {
        let rs = start_server().await;
        let server = rs.server.clone();
        let hello = encode_frame(FrameType::MaintainUdpClientAddr, 0, &[]).unwrap();

        let before = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        before.send_to(&hello, rs.internal).await.unwrap();
        wait_until(|| server.client_addr() == Some(before.local_addr().unwrap())).await;

        // Same client behind a rebound NAT mapping.
        let after = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        after.send_to(&hello, rs.internal).await.unwrap();
        wait_until(|| server.client_addr() == Some(after.local_addr().unwrap())).await;

        let user = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        user.send_to(b"hi", rs.external).await.unwrap();
        let mut buf = vec![0u8; 2048];
        let n = timeout(WAIT, after.recv(&mut buf)).await.unwrap().unwrap();
        let frame = parse_frame(&buf[..n]).unwrap();
        assert_eq!(frame.kind, FrameType::Data);
        assert_eq!(&frame.payload[..], b"hi");

        let stale = timeout(Duration::from_millis(200), before.recv(&mut buf)).await;
        assert!(stale.is_err(), "old client address still receives traffic");
    }

    #[tokio::test]
    async fn idle_local_sessions_are_torn_down() {
        let echo = spawn_echo().await;
        let rs = start_server().await;
        let settings = Settings {
            udp_session_idle: Duration::from_millis(400),
            ..Settings::default()
        };
        let (client, _stop) = start_client(echo, rs.internal, settings);
        let server = rs.server.clone();
        wait_until(|| server.client_addr().is_some()).await;

        let user = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        roundtrip(&user, rs.external, b"one").await;
        assert_eq!(client.session_count(), 1);

        // Traffic keeps pushing the deadline out.
        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(150)).await;
            roundtrip(&user, rs.external, b"tick").await;
            assert_eq!(client.session_count(), 1);
        }

        let c = client.clone();
        wait_until(|| c.session_count() == 0).await;

        // The server keeps its mapping, so the same user gets a fresh local session.
        assert_eq!(roundtrip(&user, rs.external, b"back").await, b"echo:back");
        assert_eq!(client.session_count(), 1);
        assert_eq!(rs.server.session_count(), 1);
    }

    #[tokio::test]
    async fn client_ends_on_malformed_datagram() {
        let fake_server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = UdpClient::new(ClientOptions {
            name: "test".into(),
            local_addr: "127.0.0.1:9".into(),
            internal_addr: fake_server.local_addr().unwrap().to_string(),
            settings: Settings::default(),
        });
        let (_stop, rx) = watch::channel(false);
        let task = tokio::spawn(async move { client.connect(rx).await });

        let mut buf = vec![0u8; 2048];
        let (n, from) = timeout(WAIT, fake_server.recv_from(&mut buf)).await.unwrap().unwrap();
        let hello = parse_frame(&buf[..n]).unwrap();
        assert_eq!(hello.kind, FrameType::MaintainUdpClientAddr);

        fake_server.send_to(b"not a frame", from).await.unwrap();
        let res = timeout(WAIT, task).await.unwrap().unwrap();
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn client_reports_unresolvable_local_address() {
        let client = UdpClient::new(ClientOptions {
            name: "test".into(),
            local_addr: "no-port-here".into(),
            internal_addr: "127.0.0.1:9".into(),
            settings: Settings::default(),
        });
        let (_stop, rx) = watch::channel(false);
        let res = timeout(WAIT, client.connect(rx)).await.unwrap();
        assert!(
            matches!(&res, Err(TunnelError::Resolve { addr, .. }) if addr == "no-port-here"),
            "{res:?}"
        );
    }
}
