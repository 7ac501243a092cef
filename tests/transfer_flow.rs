//! End-to-end exercise of the download flow against a scripted peer: the
//! control-channel handshake, queueing, the per-token transfer request,
//! and the raw file stream over a second connection.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crateseek::conf::{PeerConf, PoolConf};
use crateseek::peer::FileChunk;
use crateseek::pool::{Pool, PoolEvent, PoolEventReceiver, PoolHandle};
use crateseek::wire::peer::{
    code, InitMessage, PeerMessage, TransferDirection, TransferRequest,
};
use crateseek::ConnectionType;

const FILE_CONTENT: &[u8] = b"pretend this is a flac file";

fn start_pool() -> (PoolHandle, PoolEventReceiver) {
    let conf = PoolConf {
        validate_addresses: false,
        ..PoolConf::default()
    };
    let (pool, handle, events) = Pool::new(conf, PeerConf::default(), "alice");
    tokio::spawn(pool.start());
    (handle, events)
}

/// Reads one `u32 length | payload` frame off a scripted peer's socket.
async fn read_frame(socket: &mut TcpStream) -> Bytes {
    let mut len = [0u8; 4];
    socket.read_exact(&mut len).await.unwrap();
    let len = u32::from_le_bytes(len) as usize;
    let mut body = vec![0u8; len];
    socket.read_exact(&mut body).await.unwrap();
    Bytes::from(body)
}

#[tokio::test]
async fn test_download_flow_end_to_end() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (pool, mut events) = start_pool();

    // the scripted uploader listens where the "server" advertised it
    let uploader_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let uploader_addr = uploader_listener.local_addr().unwrap();

    // 1. open the control channel to the uploader
    let (handle, ready) = pool
        .connect_to("uploader", uploader_addr, ConnectionType::Peer, 0, false)
        .await
        .unwrap();
    let (mut control, _) = uploader_listener.accept().await.unwrap();
    ready.await.unwrap().unwrap();

    // consume our PeerInit on the uploader side
    let mut init = read_frame(&mut control).await;
    assert_eq!(init.get_u8(), 1);

    // 2. register the per-token handler before anything can race it, then
    // queue the download
    let request_port = handle.await_transfer_request(900).unwrap();
    handle
        .send(PeerMessage::QueueDownload {
            filename: "music\\song.flac".into(),
        })
        .unwrap();

    let mut frame = read_frame(&mut control).await;
    assert_eq!(frame.get_u32_le(), code::QUEUE_DOWNLOAD);

    // 3. the uploader offers the transfer under the agreed token
    let offer = PeerMessage::TransferRequest(TransferRequest {
        direction: TransferDirection::Upload,
        token: 900,
        filename: "music\\song.flac".into(),
        size: Some(FILE_CONTENT.len() as u64),
    });
    control.write_all(&offer.encode().unwrap()).await.unwrap();

    let request = request_port.await.unwrap();
    assert_eq!(request.token, 900);
    assert_eq!(request.size, Some(FILE_CONTENT.len() as u64));

    // 4. allow it
    handle
        .send(PeerMessage::TransferReply(
            crateseek::wire::peer::TransferReply {
                token: 900,
                allowed: true,
                size: Some(FILE_CONTENT.len() as u64),
                reason: None,
            },
        ))
        .unwrap();
    let mut frame = read_frame(&mut control).await;
    assert_eq!(frame.get_u32_le(), code::TRANSFER_REPLY);

    // 5. the uploader dials back with an F connection and streams the file
    let our_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let our_addr = our_listener.local_addr().unwrap();

    let uploader = tokio::spawn(async move {
        let mut transfer = TcpStream::connect(our_addr).await.unwrap();
        let mut frame = BytesMut::new();
        frame.put_slice(
            &InitMessage::PeerInit {
                username: "uploader".into(),
                kind: ConnectionType::FileTransfer,
                token: 900,
            }
            .encode(),
        );
        transfer.write_all(&frame).await.unwrap();

        // the downloader announces the token and start offset
        let mut init = [0u8; 12];
        transfer.read_exact(&mut init).await.unwrap();
        let mut init = &init[..];
        assert_eq!(init.get_u32_le(), 900);
        assert_eq!(init.get_u64_le(), 0);

        transfer.write_all(FILE_CONTENT).await.unwrap();
    });

    let (socket, _) = our_listener.accept().await.unwrap();
    pool.handle_incoming(socket).await.unwrap();

    // 6. the pool hands the raw-mode connection over
    let mut conn = loop {
        match events.recv().await.expect("pool event stream ended") {
            PoolEvent::FileTransferConnection {
                username,
                token,
                conn,
            } => {
                assert_eq!(username, "uploader");
                assert_eq!(token, 900);
                break conn;
            }
            _ => {}
        }
    };

    // 7. drive the raw sub-protocol and collect the file
    conn.send_file_transfer_init(900, 0).await.unwrap();

    let mut file = Vec::new();
    while file.len() < FILE_CONTENT.len() {
        match conn.receive_file_chunk(8).await.unwrap() {
            FileChunk::Data(data) => file.extend_from_slice(&data),
            FileChunk::DataWithCompletion(data) => {
                file.extend_from_slice(&data);
                break;
            }
            FileChunk::Complete => break,
        }
    }
    assert_eq!(&file[..], FILE_CONTENT);

    uploader.await.unwrap();
}
