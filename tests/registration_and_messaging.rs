//! End-to-end flow across the full stack: two real loopback sockets,
//! wired through `Connection` and `Dispatcher` exactly as
//! `ircd::server::run` wires them, exercising registration, `JOIN`,
//! `PRIVMSG` fan-out, and the transactional nick-collision scenario
//! (S6).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use ircd::config::ServerConfig;
use ircd::connection::{Connection, ConnectionLimits};
use ircd::dispatcher::Dispatcher;
use ircd::state::ServerState;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Binds a loopback listener, connects a client socket to it, and
/// returns (client-side stream, server-side stream) — the same pairing
/// `Acceptor::run` hands a freshly accepted socket from.
async fn loopback_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).await.unwrap();
    let (server, _) = listener.accept().await.unwrap();
    (client, server)
}

/// Wires one server-side socket into the dispatcher, mirroring
/// `ircd::server::run`'s per-connection setup.
async fn attach(dispatcher: &Dispatcher, server_sock: TcpStream) -> u64 {
    let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    let connection = Connection::new(server_sock, ConnectionLimits::default());

    let line_dispatcher = dispatcher.clone();
    connection
        .register_ingress_handler(Arc::new(move |line: String| {
            let dispatcher = line_dispatcher.clone();
            Box::pin(async move { dispatcher.handle_line(conn_id, line).await }) as ircd::connection::BoxFuture<ircd::Result<()>>
        }))
        .await;

    let disconnect_dispatcher = dispatcher.clone();
    connection
        .register_disconnect_handler(Arc::new(move || {
            let dispatcher = disconnect_dispatcher.clone();
            tokio::spawn(async move { dispatcher.handle_disconnect(conn_id).await });
        }))
        .await;

    dispatcher.register_connection(conn_id, connection.clone()).await;
    tokio::spawn(async move {
        let _ = connection.start().await;
    });
    conn_id
}

struct Client {
    write: tokio::net::tcp::OwnedWriteHalf,
    lines: tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
}

impl Client {
    fn new(stream: TcpStream) -> Client {
        let (read, write) = stream.into_split();
        Client { write, lines: BufReader::new(read).lines() }
    }

    async fn send(&mut self, line: &str) {
        self.write.write_all(format!("{line}\r\n").as_bytes()).await.unwrap();
    }

    /// Reads the next line, with the trailing `\r` (kept by the wire
    /// format but stripped only at `\n` by `Lines`) trimmed off.
    async fn recv(&mut self) -> String {
        let line = timeout(Duration::from_secs(2), self.lines.next_line()).await.expect("timed out waiting for a line").unwrap().expect("connection closed unexpectedly");
        line.trim_end_matches('\r').to_string()
    }

    async fn recv_numeric(&mut self, code: &str) -> String {
        loop {
            let line = self.recv().await;
            if line.split_whitespace().nth(1) == Some(code) {
                return line;
            }
        }
    }
}

fn dispatcher() -> Dispatcher {
    let config = ServerConfig::default();
    Dispatcher::new(ServerState::new(config.clone()), config)
}

async fn register(client: &mut Client, nick: &str) {
    client.send(&format!("NICK {nick}")).await;
    client.send(&format!("USER {nick} 0 * :{nick} real name")).await;
    client.recv_numeric("001").await;
}

#[tokio::test]
async fn registration_join_and_privmsg_fan_out() {
    let dispatcher = dispatcher();

    let (alice_client, alice_server) = loopback_pair().await;
    let (bob_client, bob_server) = loopback_pair().await;
    attach(&dispatcher, alice_server).await;
    attach(&dispatcher, bob_server).await;

    let mut alice = Client::new(alice_client);
    let mut bob = Client::new(bob_client);

    register(&mut alice, "alice").await;
    register(&mut bob, "bob").await;

    alice.send("JOIN #test").await;
    let join_echo = alice.recv().await;
    assert!(join_echo.contains("JOIN"), "expected a JOIN echo, got {join_echo}");
    alice.recv_numeric("366").await;

    bob.send("JOIN #test").await;
    // alice observes bob's join broadcast.
    let bob_join_seen_by_alice = alice.recv().await;
    assert!(bob_join_seen_by_alice.contains("bob") && bob_join_seen_by_alice.contains("JOIN"));
    bob.recv_numeric("366").await;

    alice.send("PRIVMSG #test :hello there").await;
    let privmsg = bob.recv().await;
    assert!(privmsg.contains("PRIVMSG #test :hello there"), "bob did not see alice's message: {privmsg}");
}

/// S6: registering `alice`, then attempting `NICK bob` where `bob`
/// already exists, leaves both nicknames mapped to their original
/// connections and yields exactly numeric 433 to the issuer.
#[tokio::test]
async fn nick_collision_leaves_state_untouched() {
    let dispatcher = dispatcher();

    let (alice_client, alice_server) = loopback_pair().await;
    let (bob_client, bob_server) = loopback_pair().await;
    let alice_conn = attach(&dispatcher, alice_server).await;
    let bob_conn = attach(&dispatcher, bob_server).await;

    let mut alice = Client::new(alice_client);
    let mut bob = Client::new(bob_client);
    register(&mut alice, "alice").await;
    register(&mut bob, "bob").await;

    alice.send("NICK bob").await;
    let reply = alice.recv_numeric("433").await;
    assert!(reply.contains("bob"));

    // State lives inside `dispatcher`, so confirm the rollback via
    // behavior instead: both connections still act under their original
    // nicknames.
    alice.send("JOIN #collision-check").await;
    let join_echo = alice.recv().await;
    assert!(join_echo.starts_with(":alice!"), "alice's mask should be unchanged: {join_echo}");

    bob.send("JOIN #collision-check").await;
    let bob_join_echo = bob.recv().await;
    assert!(bob_join_echo.starts_with(":bob!"), "bob's mask should be unchanged: {bob_join_echo}");

    assert_ne!(alice_conn, bob_conn);
}
