//! Client block against server block on loopback.
//!
//! Each test runs a short load profile end to end and checks that both
//! blocks agree transactions happened, then that the stop handshake leaves
//! nothing open.

use std::net::SocketAddr;
use std::time::Duration;

use ftp_load::config::{
    BodySize, ClientConfig, FileOp, LoadPhase, LoadProfileConfig, LoadType, ServerConfig,
    TxBodyConfig,
};
use ftp_load::{ClientBlock, ServerBlock};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn small_body() -> TxBodyConfig {
    TxBodyConfig {
        size: BodySize::Fixed(2048),
        ..TxBodyConfig::default()
    }
}

async fn bind_server() -> (ServerBlock, SocketAddr) {
    let config = ServerConfig {
        name: "srv".into(),
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        tx_body: small_body(),
        active_data_port: 0,
        ..ServerConfig::default()
    };
    let block = ServerBlock::new(config).expect("valid server config");
    let addr = block.start().await.expect("bind server");
    (block, addr)
}

fn client_config(server: SocketAddr, passive: bool, file_op: FileOp, steady: Duration) -> ClientConfig {
    ClientConfig {
        name: "cli".into(),
        server_addr: server,
        passive_data: passive,
        file_op,
        tx_body: small_body(),
        load: LoadProfileConfig {
            load_type: LoadType::Connections,
            phases: vec![LoadPhase::flat(2, Duration::ZERO, steady)],
            ..LoadProfileConfig::default()
        },
        ..ClientConfig::default()
    }
}

/// Start `client` and wait until it reports that the profile has wound down.
async fn run_to_completion(client: &ClientBlock) {
    let mut running = client.subscribe();
    client.start().expect("start client");
    let finished = async {
        while !*running.borrow_and_update() {
            running.changed().await.expect("block dropped");
        }
        while *running.borrow_and_update() {
            running.changed().await.expect("block dropped");
        }
    };
    tokio::time::timeout(Duration::from_secs(20), finished)
        .await
        .expect("profile never completed");
}

async fn check_round_trip(passive: bool, file_op: FileOp) {
    let (server, addr) = bind_server().await;
    let client = ClientBlock::new(client_config(addr, passive, file_op, Duration::from_secs(1)))
        .expect("valid client config");

    run_to_completion(&client).await;
    client.stop().await.unwrap();

    let cs = client.stats();
    assert!(cs.attempted_connections >= 2, "{cs:?}");
    assert!(cs.successful_transactions >= 1, "{cs:?}");
    assert_eq!(cs.active_connections, 0);
    match file_op {
        FileOp::Retr => assert!(cs.goodput_rx_bytes >= 2048, "{cs:?}"),
        FileOp::Stor => assert!(cs.goodput_tx_bytes >= 2048, "{cs:?}"),
    }

    server.stop().await.unwrap();
    let ss = server.stats();
    assert!(ss.successful_transactions >= 1, "{ss:?}");
    assert!(ss.total_control_connections >= 2, "{ss:?}");
    assert_eq!(ss.active_control_connections, 0);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn passive_retr_round_trip() {
    check_round_trip(true, FileOp::Retr).await;
}

#[tokio::test]
async fn active_retr_round_trip() {
    check_round_trip(false, FileOp::Retr).await;
}

#[tokio::test]
async fn passive_stor_round_trip() {
    check_round_trip(true, FileOp::Stor).await;
}

/// Stopping mid-profile tears every connection down.
#[tokio::test]
async fn stop_handshake_closes_everything() {
    let (server, addr) = bind_server().await;
    let client = ClientBlock::new(client_config(addr, true, FileOp::Retr, Duration::from_secs(60)))
        .expect("valid client config");
    client.start().unwrap();

    let opened = async {
        while client.stats().successful_connections < 2 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(10), opened)
        .await
        .expect("connections never opened");

    tokio::time::timeout(Duration::from_secs(10), client.stop())
        .await
        .expect("client stop hung")
        .unwrap();
    assert!(!client.is_running());
    assert_eq!(client.active_connections(), 0);
    assert_eq!(client.stats().active_connections, 0);

    tokio::time::timeout(Duration::from_secs(10), server.stop())
        .await
        .expect("server stop hung")
        .unwrap();
    assert_eq!(server.active_connections(), 0);
}

/// A stopped client can be started again.
#[tokio::test]
async fn client_restarts_after_stop() {
    let (server, addr) = bind_server().await;
    let client = ClientBlock::new(client_config(addr, true, FileOp::Retr, Duration::from_millis(500)))
        .expect("valid client config");

    run_to_completion(&client).await;
    client.stop().await.unwrap();
    let first = client.stats().attempted_connections;

    run_to_completion(&client).await;
    client.stop().await.unwrap();
    assert!(client.stats().attempted_connections > first);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn unreachable_server_counts_unsuccessful_connections() {
    // Grab a port, then free it so nothing is listening there.
    let spare = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = spare.local_addr().unwrap();
    drop(spare);

    let client = ClientBlock::new(ClientConfig {
        load: LoadProfileConfig {
            max_connections_attempted: 3,
            ..client_config(dead, true, FileOp::Retr, Duration::from_millis(500)).load
        },
        ..client_config(dead, true, FileOp::Retr, Duration::from_millis(500))
    })
    .unwrap();

    run_to_completion(&client).await;
    client.stop().await.unwrap();
    let stats = client.stats();
    assert_eq!(stats.attempted_connections, 3);
    assert_eq!(stats.unsuccessful_connections, 3);
    assert_eq!(stats.successful_transactions, 0);
}
