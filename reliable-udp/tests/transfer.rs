//! End-to-end file transfers over loopback, clean and through the fault
//! simulator.

use std::time::Duration;

use reliable_udp::{
    simulator::SimulatorConfig, socket::Socket, ConnError, Config, Listener, Stream,
};

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 256) as u8).collect()
}

/// Send `data` from a fresh client to a fresh listener and return what the
/// server read before EOF.
async fn transfer(
    data: Vec<u8>,
    config: Config,
    faults: Option<SimulatorConfig>,
) -> Result<Vec<u8>, ConnError> {
    let mut server_socket = Socket::bind("127.0.0.1:0".parse().unwrap()).await?;
    let mut client_socket = Socket::bind("127.0.0.1:0".parse().unwrap()).await?;
    if let Some(faults) = faults {
        server_socket = server_socket.with_faults(faults.clone());
        client_socket = client_socket.with_faults(SimulatorConfig {
            seed: faults.seed.wrapping_add(1),
            ..faults
        });
    }

    let mut listener = Listener::from_socket(server_socket, config.clone())?;
    let addr = listener.local_addr();
    let server = tokio::spawn(async move {
        let mut stream = listener.accept().await?;
        let body = stream.receive_to_end().await?;
        stream.close().await?;
        Ok::<_, ConnError>(body)
    });

    let mut client = Stream::connect(client_socket, addr, config).await?;
    client.send(&data).await?;
    client.close().await?;

    server.await.expect("server task panicked")
}

#[tokio::test]
async fn clean_link_delivers_exact_bytes() {
    let data = payload(200_000);
    let got = tokio::time::timeout(
        Duration::from_secs(20),
        transfer(data.clone(), Config::fast(), None),
    )
    .await
    .expect("transfer timed out")
    .unwrap();
    assert_eq!(got.len(), data.len());
    assert!(got == data, "payload corrupted");
}

#[tokio::test]
async fn empty_stream_is_just_handshake_and_teardown() {
    let got = transfer(Vec::new(), Config::fast(), None).await.unwrap();
    assert!(got.is_empty());
}

#[tokio::test]
async fn lossy_link_delivers_exact_bytes() {
    let data = payload(50_000);
    let faults = SimulatorConfig {
        loss_rate: 0.1,
        duplicate_rate: 0.05,
        reorder_rate: 0.1,
        reorder_delay: Duration::from_millis(15),
        seed: 7,
    };
    // Long enough linger to re-acknowledge several lost final FINs.
    let mut config = Config::fast();
    config.linger = Duration::from_secs(1);
    let got = tokio::time::timeout(
        Duration::from_secs(60),
        transfer(data.clone(), config, Some(faults)),
    )
    .await
    .expect("transfer timed out")
    .unwrap();
    assert!(got == data, "payload corrupted");
}

#[tokio::test]
async fn small_segments_and_window() {
    let mut config = Config::fast();
    config.mss = 64;
    config.window = 256;
    config.max_reorder = 512;
    let data = payload(10_000);
    let got = transfer(data.clone(), config, None).await.unwrap();
    assert_eq!(got, data);
}

#[tokio::test]
async fn send_applies_backpressure_but_completes() {
    let mut config = Config::fast();
    config.send_buffer = 4096;
    let data = payload(64 * 1024);
    let got = transfer(data.clone(), config, None).await.unwrap();
    assert_eq!(got, data);
}
