use std::time::Duration;

use tokio_util::sync::CancellationToken;

use pping::probe::TcpProbe;
use pping::resolver::{AddressFamily, SystemResolver, Target};
use pping::{ErrorKind, Probe, RunConfig, Runner};

fn closed_port() -> u16 {
    // Bind, note the port, then release it so nothing listens there.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn closed_port_is_a_transport_failure() {
    let port = closed_port();
    let target = Target::new("127.0.0.1", SystemResolver::shared(AddressFamily::Any));
    let mut probe = TcpProbe::new(target, port, Duration::from_secs(1));

    let err = probe.ping().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert!(err.to_string().contains(&format!("127.0.0.1:{}", port)));
}

#[tokio::test]
async fn closed_port_run_counts_one_failure() {
    let port = closed_port();
    let target = Target::new("127.0.0.1", SystemResolver::shared(AddressFamily::Any));
    let mut probe = TcpProbe::new(target, port, Duration::from_secs(1));
    let runner = Runner::new(
        RunConfig {
            count: 1,
            infinite: false,
            interval: Duration::ZERO,
        },
        CancellationToken::new(),
    );

    let mut out: Vec<u8> = Vec::new();
    let stats = runner.run(&mut probe, &mut out).await.unwrap();
    assert_eq!(stats.sent, 1);
    assert_eq!(stats.failed, 1);
    assert!(!stats.is_clean());
    assert!(String::from_utf8(out).unwrap().contains("failed = 1 (100%)"));
}
