use tokio::time::{advance, timeout};

use super::*;
use crate::client::ClientLink;
use crate::proto::make_data_packet;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn token_frame(token: &Token, payload: &[u8]) -> Vec<u8> {
    proto::make_token_packet(token, &make_data_packet(0, payload))
}

async fn local_server(binds: usize) -> Result<Arc<ServerLink>> {
    let mut local_binds = Vec::new();
    for _ in 0..binds {
        let addr: SocketAddr = SocketAddr::new([127, 0, 0, 1].into(), 0);
        local_binds.push(LocalBind::new(bind_udp(addr, false).await?));
    }
    // No receiver tasks: the tests below drive handle_datagram directly.
    Ok(ServerLink::with_binds(local_binds))
}

fn from_addr(port: u16) -> SocketAddr {
    SocketAddr::new([127, 0, 0, 1].into(), port)
}

#[tokio::test]
async fn test_token_frame_creates_slave_and_path() -> Result<()> {
    let server = local_server(2).await?;
    let token = Token::generate();

    let handled = server.handle_datagram(&server.binds[0], from_addr(40001), &token_frame(&token, b"hi"));
    let (who, frame) = handled.expect("token frame should be accepted");
    assert_eq!(who, token);
    assert_eq!(frame, make_data_packet(0, b"hi"));

    let state = server.state.lock();
    let slave = state.token_to_slave.get(&token).expect("slave created");
    assert_eq!(slave.connection_id(), 0);
    assert_eq!(slave.path_count(), 1);

    // The binding is reachable through both indexes.
    let path = server.binds[0]
        .token_to_path
        .lock()
        .get(&token)
        .cloned()
        .expect("path indexed on the local bind");
    assert!(slave.has_path(&path));
    assert!(server.binds[1].token_to_path.lock().get(&token).is_none());
    Ok(())
}

#[tokio::test]
async fn test_token_frame_on_second_bind_appends_path() -> Result<()> {
    let server = local_server(2).await?;
    let token = Token::generate();
    let frame = token_frame(&token, b"hi");

    assert!(server.handle_datagram(&server.binds[0], from_addr(40001), &frame).is_some());
    assert!(server.handle_datagram(&server.binds[1], from_addr(40002), &frame).is_some());

    let state = server.state.lock();
    let slave = state.token_to_slave.get(&token).expect("slave");
    assert_eq!(slave.path_count(), 2);
    for bind in &server.binds {
        let path = bind
            .token_to_path
            .lock()
            .get(&token)
            .cloned()
            .expect("path on every bind");
        assert!(slave.has_path(&path));
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_stale_bootstrap_is_rejected() -> Result<()> {
    let server = local_server(2).await?;
    let token = Token::generate();
    let frame = token_frame(&token, b"hi");

    assert!(server.handle_datagram(&server.binds[0], from_addr(40001), &frame).is_some());

    advance(BOOTSTRAP_WINDOW + Duration::from_secs(1)).await;

    // Neither a new path nor the already bound one accepts token frames now.
    assert!(server.handle_datagram(&server.binds[1], from_addr(40002), &frame).is_none());
    assert!(server.handle_datagram(&server.binds[0], from_addr(40001), &frame).is_none());

    let state = server.state.lock();
    assert_eq!(state.token_to_slave.get(&token).expect("slave kept").path_count(), 1);
    assert!(server.binds[1].token_to_path.lock().get(&token).is_none());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_connection_id_opens_new_path_past_bootstrap() -> Result<()> {
    let server = local_server(2).await?;
    let token = Token::generate();

    assert!(server
        .handle_datagram(&server.binds[0], from_addr(40001), &token_frame(&token, b"hi"))
        .is_some());
    assert!(server.add_slave(token.as_bytes(), 0xDEAD_BEEF).await);

    advance(BOOTSTRAP_WINDOW + Duration::from_secs(1)).await;

    let frame = make_data_packet(0xDEAD_BEEF, b"x");
    let handled = server.handle_datagram(&server.binds[1], from_addr(40002), &frame);
    let (who, forwarded) = handled.expect("no bootstrap window on the connection id path");
    assert_eq!(who, token);
    assert_eq!(forwarded, frame);

    let state = server.state.lock();
    assert_eq!(state.token_to_slave.get(&token).expect("slave").path_count(), 2);
    assert!(server.binds[1].token_to_path.lock().get(&token).is_some());
    Ok(())
}

#[tokio::test]
async fn test_unknown_connection_id_is_dropped() -> Result<()> {
    let server = local_server(1).await?;
    let frame = make_data_packet(7, b"x");
    assert!(server.handle_datagram(&server.binds[0], from_addr(40001), &frame).is_none());
    Ok(())
}

#[tokio::test]
async fn test_short_datagram_is_dropped() -> Result<()> {
    let server = local_server(1).await?;
    assert!(server
        .handle_datagram(&server.binds[0], from_addr(40001), &[1, 2, 3, 4])
        .is_none());
    assert!(server.state.lock().token_to_slave.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_add_slave_indexes_connection_id() -> Result<()> {
    let server = local_server(1).await?;
    let token = Token::generate();

    // Unknown slaves can not be admitted.
    assert!(!server.add_slave(token.as_bytes(), 1).await);
    assert!(!server.add_slave(b"short", 1).await);

    assert!(server
        .handle_datagram(&server.binds[0], from_addr(40001), &token_frame(&token, b"hi"))
        .is_some());
    assert!(server.add_slave(token.as_bytes(), 42).await);

    let state = server.state.lock();
    assert_eq!(state.connection_id_to_token.get(&42), Some(&token));
    assert_eq!(
        state.token_to_slave.get(&token).expect("slave").connection_id(),
        42
    );
    Ok(())
}

#[tokio::test]
async fn test_next_connection_id_is_never_zero() -> Result<()> {
    let server = local_server(1).await?;
    for _ in 0..16 {
        assert_ne!(server.next_connection_id(), 0);
    }
    Ok(())
}

#[tokio::test]
async fn test_close_slave_clears_every_index() -> Result<()> {
    let server = local_server(2).await?;
    let token = Token::generate();
    let frame = token_frame(&token, b"hi");

    assert!(server.handle_datagram(&server.binds[0], from_addr(40001), &frame).is_some());
    assert!(server.handle_datagram(&server.binds[1], from_addr(40002), &frame).is_some());
    assert!(server.add_slave(token.as_bytes(), 42).await);

    server.close_slave(token.as_bytes()).await;
    {
        let state = server.state.lock();
        assert!(state.token_to_slave.is_empty());
        assert!(state.connection_id_to_token.is_empty());
    }
    for bind in &server.binds {
        assert!(bind.token_to_path.lock().is_empty());
    }

    // The same token starts over as a brand new slave.
    assert!(server.handle_datagram(&server.binds[0], from_addr(40001), &frame).is_some());
    let state = server.state.lock();
    assert_eq!(state.token_to_slave.get(&token).expect("slave").connection_id(), 0);
    Ok(())
}

#[tokio::test]
async fn test_sendto_unknown_slave_fails() -> Result<()> {
    let server = local_server(1).await?;
    let token = Token::generate();
    assert_eq!(
        server.sendto(b"x", token.as_bytes()).await,
        Err(Error::ErrSlaveNotFound)
    );
    assert_eq!(
        server.sendto(b"x", b"not-a-token").await,
        Err(Error::ErrSlaveNotFound)
    );
    Ok(())
}

#[tokio::test]
async fn test_bind_applies_reuse_address() -> Result<()> {
    let locals = [SocketAddr::new([127, 0, 0, 1].into(), 0)];
    let server = ServerLink::bind(&locals, BIND_DEFAULT | BIND_REUSE_ADDRESS).await?;
    assert_eq!(server.local_addrs()?.len(), 1);
    server.close().await;
    Ok(())
}

#[tokio::test]
async fn test_client_bootstrap_and_admission() -> Result<()> {
    let _ = env_logger::try_init();

    let locals = [
        SocketAddr::new([127, 0, 0, 1].into(), 0),
        SocketAddr::new([127, 0, 0, 1].into(), 0),
    ];
    let server = ServerLink::bind(&locals, BIND_DEFAULT).await?;
    let remotes = server.local_addrs()?;
    let client = ClientLink::connect(&remotes, ALLOW_IPV4).await?;

    // Bootstrap: the engine payload travels wrapped in a token frame.
    client.output(b"hi").await?;
    let mut buf = vec![0u8; RECEIVE_BUFFER_SIZE];
    let mut who = Vec::new();
    let n = timeout(RECV_TIMEOUT, server.recvfrom(&mut buf, &mut who))
        .await
        .expect("bootstrap datagram")?;
    assert_eq!(&buf[..n], &make_data_packet(0, b"hi")[..]);
    assert_eq!(who, client.token().as_bytes());

    // Admission.
    let connection_id = server.next_connection_id();
    assert!(server.add_slave(&who, connection_id).await);
    client.set_connection_id(connection_id);

    // Post-admission traffic is classified by connection id, and the second
    // send lands on the second bind, adding a path there.
    client.output(b"x").await?;
    let n = timeout(RECV_TIMEOUT, server.recvfrom(&mut buf, &mut who))
        .await
        .expect("admitted datagram")?;
    assert_eq!(&buf[..n], &make_data_packet(connection_id, b"x")[..]);

    let token = Token::from_slice(&who).expect("origin token");
    for bind in &server.binds {
        assert!(bind.token_to_path.lock().get(&token).is_some());
    }

    // Server reply arrives raw on the client side, with an empty origin.
    let reply = make_data_packet(connection_id, b"pong");
    assert_eq!(server.sendto(&reply, &who).await?, reply.len());
    let mut origin = vec![1u8];
    let n = timeout(RECV_TIMEOUT, client.recvfrom(&mut buf, &mut origin))
        .await
        .expect("reply datagram")?;
    assert_eq!(&buf[..n], &reply[..]);
    assert!(origin.is_empty());

    client.close().await;
    server.close().await;
    Ok(())
}
