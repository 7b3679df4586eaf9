//! ---
//! lb_section: "01-core-functionality"
//! lb_subsection: "binary"
//! lb_type: "source"
//! lb_scope: "code"
//! lb_description: "Inject and monitor bench tools that stand in for stations."
//! lb_version: "v0.1.0"
//! lb_owner: "line-controls"
//! ---
//! Bench tools standing in for station controllers.
use std::time::Duration;

use anyhow::{Context, Result};
use linebus_signal::{encode_record, Decoded, RecordDecoder, SocketAddress, WireMessage};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Write one record to a console input port, as a station producer would.
pub async fn inject(
    to: &SocketAddress,
    message: &WireMessage,
    connect_timeout: Duration,
) -> Result<()> {
    let mut stream = tokio::time::timeout(
        connect_timeout,
        TcpStream::connect((to.host.as_str(), to.port)),
    )
    .await
    .with_context(|| format!("connect to {} timed out", to))?
    .with_context(|| format!("connect to {} failed", to))?;
    stream.write_all(&encode_record(message)?).await?;
    stream.shutdown().await?;
    info!(
        address = %to,
        name = %message.name,
        cd = %message.cd,
        status = message.status,
        "record injected"
    );
    Ok(())
}

/// One record seen by [`monitor`].
#[derive(Debug, Clone, Serialize)]
pub struct MonitoredRecord {
    pub peer: SocketAddress,
    #[serde(flatten)]
    pub message: WireMessage,
}

/// Accept console connections on `listener` and forward every decoded record.
///
/// Runs until `shutdown` fires or the record receiver is dropped.
pub async fn monitor(
    listener: TcpListener,
    records: mpsc::UnboundedSender<MonitoredRecord>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let mut readers = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = records.closed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let peer = SocketAddress::from(peer);
                    info!(peer = %peer, "console connected");
                    readers.spawn(read_records(stream, peer, records.clone()));
                }
                Err(err) => warn!(error = %err, "accept failed"),
            },
            Some(_) = readers.join_next(), if !readers.is_empty() => {}
        }
    }
    readers.shutdown().await;
    Ok(())
}

async fn read_records(
    mut stream: TcpStream,
    peer: SocketAddress,
    records: mpsc::UnboundedSender<MonitoredRecord>,
) {
    let mut decoder = RecordDecoder::default();
    let mut buf = [0u8; 1024];
    loop {
        let n = match stream.read(&mut buf).await {
            Ok(n) => n,
            Err(err) => {
                warn!(peer = %peer, error = %err, "console connection dropped");
                return;
            }
        };
        let decoded = if n == 0 {
            decoder.finish().into_iter().collect()
        } else {
            decoder.push(&buf[..n])
        };
        for outcome in decoded {
            match outcome {
                Decoded::Message(message) => {
                    let record = MonitoredRecord {
                        peer: peer.clone(),
                        message,
                    };
                    if records.send(record).is_err() {
                        return;
                    }
                }
                Decoded::Discarded(err) => debug!(peer = %peer, error = %err, "fragment dropped"),
            }
        }
        if n == 0 {
            info!(peer = %peer, "console disconnected");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linebus_signal::{OutputSettings, OutputSignal, OutputSignalManager};
    use tokio::time::timeout;

    #[tokio::test]
    async fn inject_writes_one_terminated_record() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = SocketAddress::from(listener.local_addr().expect("addr"));
        let message = WireMessage::new("POS", "POS", true).with_value("{\"orderId\":7}");

        let sent = message.clone();
        let writer = tokio::spawn(async move {
            inject(&address, &sent, Duration::from_secs(1)).await
        });
        let (mut stream, _) = listener.accept().await.expect("accept");
        let mut received = Vec::new();
        stream.read_to_end(&mut received).await.expect("read");
        writer.await.expect("join").expect("inject");

        assert!(received.ends_with(b"\r\n"));
        let mut decoder = RecordDecoder::default();
        match decoder.push(&received).pop() {
            Some(Decoded::Message(decoded)) => assert_eq!(decoded, message),
            other => panic!("unexpected decode result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn inject_reports_refused_connection() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .and_then(|l| l.local_addr())
            .map(|a| a.port())
            .expect("free port");
        let message = WireMessage::new("capperIdle", "Coordinator", true);
        let err = inject(&SocketAddress::loopback(port), &message, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("connect to"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn monitor_sees_console_broadcasts() {
        linebus_logging::init();
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = SocketAddress::from(listener.local_addr().expect("addr"));
        let (records_tx, mut records) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let monitor = tokio::spawn(monitor(listener, records_tx, shutdown_rx));

        let manager = OutputSignalManager::new(OutputSettings {
            tick_interval: Duration::from_millis(20),
            connect_timeout: Duration::from_millis(200),
            settle_delay: Duration::ZERO,
            write_timeout: Duration::from_millis(200),
        });
        manager.register(
            OutputSignal::new("bottleAtPos5", "RotaryTableControllerCD", address)
                .with_initial_status(true),
        );
        let handle = manager.start();

        let record = timeout(Duration::from_secs(2), records.recv())
            .await
            .expect("record in time")
            .expect("monitor alive");
        assert_eq!(record.message.name, "bottleAtPos5");
        assert!(record.message.status);
        let rendered = serde_json::to_value(&record).expect("serialize");
        assert_eq!(rendered["cd"], "RotaryTableControllerCD");
        assert!(rendered["peer"].is_string());

        handle.shutdown().await.expect("manager stops");
        shutdown_tx.send(()).expect("monitor listening");
        monitor.await.expect("join").expect("monitor exits cleanly");
    }
}
