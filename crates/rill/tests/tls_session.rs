mod common;

use std::{cell::RefCell, rc::Rc, sync::Arc, time::Duration};

use rill::{
    Driver, DowngradeEventKind, ReceiveOptions, SendOptions, SocketOptions, UpgradeMode,
    UpgradeOptions,
};
use rustls_pki_types::PrivateKeyDer;

use common::{Recorder, drive_until, tcp_pair};

fn tls_configs() -> (Arc<rustls::ClientConfig>, Arc<rustls::ServerConfig>) {
    let ca_key = rcgen::KeyPair::generate().unwrap();
    let mut ca_params = rcgen::CertificateParams::new(Vec::new()).unwrap();
    ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();

    let server_key = rcgen::KeyPair::generate().unwrap();
    let server_params = rcgen::CertificateParams::new(vec!["localhost".into()]).unwrap();
    let server_cert = server_params.signed_by(&server_key, &ca_cert, &ca_key).unwrap();

    let mut roots = rustls::RootCertStore::empty();
    roots.add(ca_cert.der().clone()).unwrap();
    let client = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let server = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(
            vec![server_cert.der().clone()],
            PrivateKeyDer::Pkcs8(server_key.serialize_der().into()),
        )
        .unwrap();
    (Arc::new(client), Arc::new(server))
}

/// Upgrade both ends, exchange a message over TLS, downgrade, then keep
/// talking in plaintext.
#[test]
fn upgrade_echo_downgrade() {
    let (client_config, server_config) = tls_configs();

    let mut driver = Driver::new().unwrap();
    let client_session = Recorder::new();
    let server_session = Recorder::new();
    let (client, server) = tcp_pair(
        &mut driver,
        SocketOptions::default(),
        SocketOptions::default(),
        Some(Arc::clone(&client_session)),
        Some(Arc::clone(&server_session)),
    );

    let client_upgraded = Rc::new(RefCell::new(false));
    let server_upgraded = Rc::new(RefCell::new(false));
    let saw_peer_certificate = Rc::new(RefCell::new(false));
    {
        let (socket, reactor) = driver.entry(server).unwrap();
        let done = Rc::clone(&server_upgraded);
        socket
            .upgrade(
                reactor,
                UpgradeMode::Server { config: Arc::clone(&server_config) },
                &UpgradeOptions { deadline: Some(Duration::from_secs(5)), token: None },
                Box::new(move |result| {
                    result.unwrap();
                    *done.borrow_mut() = true;
                }),
            )
            .unwrap();
    }
    {
        let (socket, reactor) = driver.entry(client).unwrap();
        let done = Rc::clone(&client_upgraded);
        let saw_cert = Rc::clone(&saw_peer_certificate);
        socket
            .upgrade(
                reactor,
                UpgradeMode::Client {
                    config: Arc::clone(&client_config),
                    server_name: "localhost".into(),
                },
                &UpgradeOptions { deadline: Some(Duration::from_secs(5)), token: None },
                Box::new(move |result| {
                    let context = result.unwrap();
                    *saw_cert.borrow_mut() = context.peer_certificate.is_some();
                    *done.borrow_mut() = true;
                }),
            )
            .unwrap();
    }

    drive_until(&mut driver, Duration::from_secs(10), || {
        *client_upgraded.borrow() && *server_upgraded.borrow()
    });
    assert!(*saw_peer_certificate.borrow());

    // Application data over the encrypted session.
    let secret = b"attack at dawn, over tls".to_vec();
    let received: Rc<RefCell<Option<Vec<u8>>>> = Rc::new(RefCell::new(None));
    {
        let received = Rc::clone(&received);
        let (socket, reactor) = driver.entry(server).unwrap();
        socket
            .receive_with(
                reactor,
                &ReceiveOptions {
                    min_size: secret.len(),
                    max_size: secret.len(),
                    ..ReceiveOptions::default()
                },
                Box::new(move |result| {
                    let (_, data) = result.unwrap();
                    *received.borrow_mut() = Some(data.to_vec());
                }),
            )
            .unwrap();
    }
    {
        let (socket, reactor) = driver.entry(client).unwrap();
        socket.send(reactor, secret.clone(), &SendOptions::default(), None).unwrap();
    }
    drive_until(&mut driver, Duration::from_secs(10), || received.borrow().is_some());
    assert_eq!(received.borrow().as_deref(), Some(&secret[..]));

    // Client initiates the downgrade; both ends drop TLS.
    {
        let (socket, reactor) = driver.entry(client).unwrap();
        socket.downgrade(reactor).unwrap();
    }
    drive_until(&mut driver, Duration::from_secs(10), || {
        client_session.saw_downgrade(DowngradeEventKind::Complete)
            && server_session.saw_downgrade(DowngradeEventKind::Complete)
    });
    assert!(server_session.saw_downgrade(DowngradeEventKind::Initiated));

    // Plaintext flows again after the downgrade.
    let plain = b"back in the clear".to_vec();
    let received_plain: Rc<RefCell<Option<Vec<u8>>>> = Rc::new(RefCell::new(None));
    {
        let received_plain = Rc::clone(&received_plain);
        let (socket, reactor) = driver.entry(server).unwrap();
        socket
            .receive_with(
                reactor,
                &ReceiveOptions {
                    min_size: plain.len(),
                    max_size: plain.len(),
                    ..ReceiveOptions::default()
                },
                Box::new(move |result| {
                    let (_, data) = result.unwrap();
                    *received_plain.borrow_mut() = Some(data.to_vec());
                }),
            )
            .unwrap();
    }
    {
        let (socket, reactor) = driver.entry(client).unwrap();
        socket.send(reactor, plain.clone(), &SendOptions::default(), None).unwrap();
    }
    drive_until(&mut driver, Duration::from_secs(10), || received_plain.borrow().is_some());
    assert_eq!(received_plain.borrow().as_deref(), Some(&plain[..]));
}

/// An upgrade cancelled by teardown fails its callback instead of leaving it
/// pending.
#[test]
fn shutdown_during_upgrade_fails_the_upgrade() {
    let (client_config, _) = tls_configs();

    let mut driver = Driver::new().unwrap();
    let (client, _server) =
        tcp_pair(&mut driver, SocketOptions::default(), SocketOptions::default(), None, None);

    let outcome: Rc<RefCell<Option<rill::Error>>> = Rc::new(RefCell::new(None));
    {
        let (socket, reactor) = driver.entry(client).unwrap();
        let outcome = Rc::clone(&outcome);
        socket
            .upgrade(
                reactor,
                UpgradeMode::Client { config: client_config, server_name: "localhost".into() },
                &UpgradeOptions::default(),
                Box::new(move |result| {
                    *outcome.borrow_mut() = Some(result.unwrap_err());
                }),
            )
            .unwrap();
        socket
            .shutdown(
                reactor,
                rill::ShutdownDirection::Both,
                rill::ShutdownMode::Immediate,
            )
            .unwrap();
    }
    drive_until(&mut driver, Duration::from_secs(5), || outcome.borrow().is_some());
    assert_eq!(*outcome.borrow(), Some(rill::Error::Cancelled));
}
