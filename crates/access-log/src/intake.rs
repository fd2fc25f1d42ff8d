// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! UDP intake for edge-node log reports.
//!
//! Every datagram carries newline-delimited JSON records and is admitted to
//! the queue as one batch. Nothing is acknowledged.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::constants::INTAKE_BUFFER_SIZE;
use crate::queue::QueueManager;
use crate::record::LogRecord;

pub struct LogIntake {
    socket: UdpSocket,
    queue: Arc<QueueManager>,
    cancel_token: CancellationToken,
}

impl LogIntake {
    pub async fn bind(
        host: &str,
        port: u16,
        queue: Arc<QueueManager>,
        cancel_token: CancellationToken,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind(format!("{host}:{port}")).await?;
        Ok(Self {
            socket,
            queue,
            cancel_token,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receives datagrams until cancelled.
    pub async fn spin(self) {
        let mut buf = vec![0u8; INTAKE_BUFFER_SIZE];
        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!("ACCESS_LOG | intake stopped");
                    break;
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((amt, src)) => self.consume(&buf[..amt], src),
                    Err(e) => error!("ACCESS_LOG | intake receive failed: {e}"),
                },
            }
        }
    }

    fn consume(&self, datagram: &[u8], src: SocketAddr) {
        let records = parse_batch(datagram);
        trace!("ACCESS_LOG | received {} records from {src}", records.len());
        if records.is_empty() {
            return;
        }
        let summary = self.queue.admit(records);
        debug!(
            "ACCESS_LOG | batch from {src}: admitted {}, sampled out {}, dropped {}",
            summary.admitted, summary.sampled_out, summary.dropped_full
        );
    }
}

/// Decodes one record per non-empty line, skipping lines that fail to parse.
pub fn parse_batch(datagram: &[u8]) -> Vec<LogRecord> {
    datagram
        .split(|b| *b == b'\n')
        .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
        .filter_map(|line| match serde_json::from_slice::<LogRecord>(line) {
            Ok(record) => Some(record),
            Err(e) => {
                error!(
                    "ACCESS_LOG | failed to parse log record {}: {e}",
                    String::from_utf8_lossy(line).trim()
                );
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tracing_test::traced_test;

    use super::*;

    #[test]
    #[traced_test]
    fn test_parse_batch_skips_bad_lines() {
        let datagram = b"{\"requestId\":\"17053128000000000001\",\"status\":200}\n\
            not json\n\
            \n\
            {\"requestId\":\"17053128000000000002\",\"status\":404}\r\n";
        let records = parse_batch(datagram);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].status, 404);
        assert!(logs_contain("failed to parse log record not json"));
    }

    #[tokio::test]
    async fn test_intake_admits_datagrams() {
        let queue = Arc::new(QueueManager::default());
        let cancel = CancellationToken::new();
        let intake = LogIntake::bind("127.0.0.1", 0, queue.clone(), cancel.clone())
            .await
            .unwrap();
        let addr = intake.local_addr().unwrap();
        let handle = tokio::spawn(intake.spin());

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(
                concat!(
                    "{\"requestId\":\"17053128000000000001\"}\n",
                    "{\"requestId\":\"17053128000000000002\"}",
                )
                .as_bytes(),
                addr,
            )
            .await
            .unwrap();

        for _ in 0..50 {
            if queue.pending() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(queue.pending(), 2);

        cancel.cancel();
        handle.await.unwrap();
    }
}
