//! Newline-delimited JSON-RPC over a byte stream.
//!
//! Each request runs as its own task so a slow VM operation never blocks the
//! reader; responses are written by a single writer task in completion order.
//! On EOF the server stops reading, lets in-flight requests finish, flushes
//! their responses and closes every pool. The shutdown signal additionally
//! cancels requests still waiting for a VM lock or a connection.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use kvmctl_protocol::{codes, encode_line, parse_request, Response, RpcError, MAX_LINE_LENGTH};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::dispatch::Dispatcher;

const OUTBOX_CAPACITY: usize = 256;

/// Most bytes buffered for one line, terminator included.
const LINE_LIMIT: usize = MAX_LINE_LENGTH + 2;

/// Serve requests from `reader` until EOF or `shutdown` resolves.
pub async fn serve<R, W, S>(
    dispatcher: Arc<Dispatcher>,
    reader: R,
    writer: W,
    shutdown: S,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
    S: Future<Output = ()>,
{
    let (tx, rx) = mpsc::channel::<Response>(OUTBOX_CAPACITY);
    let writer_task = tokio::spawn(write_responses(writer, rx));

    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut discarding = false;
    let mut in_flight = JoinSet::new();
    let mut signalled = false;
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown requested, draining in-flight requests");
                signalled = true;
                break;
            }
            // Partial lines stay in `buf` if another branch wins.
            read = next_line(&mut reader, &mut buf, &mut discarding) => {
                let reply = match read {
                    Ok(Line::Eof) => {
                        info!("input closed, draining in-flight requests");
                        break;
                    }
                    Ok(Line::TooLong) => {
                        debug!(limit = MAX_LINE_LENGTH, "rejected oversized line");
                        Some(line_too_long())
                    }
                    Ok(Line::Complete) => {
                        let reply = admit(&dispatcher, &buf, &tx, &mut in_flight);
                        buf.clear();
                        reply
                    }
                    Err(e) => {
                        error!(error = %e, "failed to read from input");
                        break;
                    }
                };
                if let Some(resp) = reply {
                    if tx.send(resp).await.is_err() {
                        warn!("response writer stopped, no longer reading");
                        break;
                    }
                }
            }
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                log_join(joined);
            }
        }
    }

    if signalled {
        dispatcher.begin_shutdown();
    }
    loop {
        tokio::select! {
            joined = in_flight.join_next() => match joined {
                Some(joined) => log_join(joined),
                None => break,
            },
            _ = &mut shutdown, if !signalled => {
                info!("shutdown requested while draining");
                signalled = true;
                dispatcher.begin_shutdown();
            }
        }
    }
    drop(tx);
    let written = writer_task.await.context("response writer task failed")?;
    dispatcher.close().await;
    info!("server stopped");
    written
}

#[derive(Debug, PartialEq, Eq)]
enum Line {
    /// `buf` holds one line, terminator included when present.
    Complete,
    /// The line exceeded [`LINE_LIMIT`]; its bytes were dropped.
    TooLong,
    Eof,
}

/// Read the next line into `buf`, never holding more than [`LINE_LIMIT`]
/// bytes of it. Cancel-safe: progress lives in `buf` and `discarding`.
async fn next_line<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    discarding: &mut bool,
) -> std::io::Result<Line>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if std::mem::take(discarding) {
                return Ok(Line::TooLong);
            }
            return Ok(if buf.is_empty() { Line::Eof } else { Line::Complete });
        }

        let (chunk, terminated) = match available.iter().position(|b| *b == b'\n') {
            Some(i) => (&available[..=i], true),
            None => (available, false),
        };
        let used = chunk.len();
        if !*discarding {
            if buf.len() + used > LINE_LIMIT {
                *discarding = true;
                buf.clear();
                buf.shrink_to_fit();
            } else {
                buf.extend_from_slice(chunk);
            }
        }
        reader.consume(used);

        if terminated {
            return Ok(if std::mem::take(discarding) {
                Line::TooLong
            } else {
                Line::Complete
            });
        }
    }
}

fn line_too_long() -> Response {
    Response::failure(
        Value::Null,
        RpcError::new(codes::INVALID_REQUEST, "Invalid Request: line too long")
            .with_kind("invalid_request"),
    )
}

/// Parse one raw line and spawn its handler. Returns an immediate error
/// reply for lines that are not valid requests.
fn admit(
    dispatcher: &Arc<Dispatcher>,
    raw: &[u8],
    tx: &mpsc::Sender<Response>,
    in_flight: &mut JoinSet<()>,
) -> Option<Response> {
    let Ok(line) = std::str::from_utf8(raw) else {
        return Some(Response::failure(
            Value::Null,
            RpcError::new(codes::PARSE_ERROR, "Parse error: invalid UTF-8")
                .with_kind("parse_error"),
        ));
    };
    let line = line.trim_end_matches(['\n', '\r']);
    if line.trim().is_empty() {
        return None;
    }

    let req = match parse_request(line) {
        Ok(req) => req,
        Err(resp) => {
            debug!(code = resp.error.as_ref().map(|e| e.code), "rejected malformed request");
            return Some(resp);
        }
    };

    let dispatcher = Arc::clone(dispatcher);
    let tx = tx.clone();
    in_flight.spawn(async move {
        if let Some(resp) = dispatcher.handle(req).await {
            // The writer only goes away once every sender is dropped.
            let _ = tx.send(resp).await;
        }
    });
    None
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "request task failed");
    }
}

async fn write_responses<W>(mut writer: W, mut rx: mpsc::Receiver<Response>) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(resp) = rx.recv().await {
        let line = encode_line(&resp).context("encoding response")?;
        writer
            .write_all(line.as_bytes())
            .await
            .context("writing response")?;
        writer.flush().await.context("flushing response")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::hypervisor::fake::FakeHypervisor;
    use crate::hypervisor::DomainState;
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    struct Client {
        lines: tokio::io::Lines<BufReader<ReadHalf<DuplexStream>>>,
        input: WriteHalf<DuplexStream>,
    }

    impl Client {
        async fn send(&mut self, line: &str) {
            self.input.write_all(line.as_bytes()).await.unwrap();
            self.input.write_all(b"\n").await.unwrap();
        }

        async fn recv(&mut self) -> Response {
            let line = self.lines.next_line().await.unwrap().expect("response line");
            serde_json::from_str(&line).unwrap()
        }

        /// Read `n` responses keyed by id.
        async fn recv_n(&mut self, n: usize) -> HashMap<String, Response> {
            let mut out = HashMap::new();
            for _ in 0..n {
                let resp = self.recv().await;
                out.insert(resp.id.to_string(), resp);
            }
            out
        }
    }

    fn start<S>(
        fake: &FakeHypervisor,
        shutdown: S,
    ) -> (Client, tokio::task::JoinHandle<anyhow::Result<()>>)
    where
        S: Future<Output = ()> + Send + 'static,
    {
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(Config::default()),
            Arc::new(fake.clone()),
            None,
        ));
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_r, server_w) = tokio::io::split(server);
        let (client_r, client_w) = tokio::io::split(client);
        let handle = tokio::spawn(serve(dispatcher, server_r, server_w, shutdown));
        let client = Client {
            lines: BufReader::new(client_r).lines(),
            input: client_w,
        };
        (client, handle)
    }

    #[tokio::test]
    async fn test_requests_get_matching_responses() {
        let fake = FakeHypervisor::new().with_domain("xeon", DomainState::Running);
        let (mut client, server) = start(&fake, std::future::pending());

        client
            .send(r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#)
            .await;
        client
            .send(r#"{"jsonrpc":"2.0","id":"b","method":"tools/call","params":{"name":"list_vms","arguments":{}}}"#)
            .await;
        let replies = client.recv_n(2).await;

        let init = &replies["1"];
        assert_eq!(init.jsonrpc, "2.0");
        assert_eq!(init.result.as_ref().unwrap()["serverInfo"]["name"], "kvm-control");
        let list = replies["\"b\""].result.as_ref().unwrap();
        assert_eq!(list[0]["name"], "xeon");

        client.input.shutdown().await.unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_malformed_lines_do_not_stop_the_server() {
        let fake = FakeHypervisor::new();
        let (mut client, server) = start(&fake, std::future::pending());

        client.send("this is not json").await;
        let resp = client.recv().await;
        assert_eq!(resp.id, Value::Null);
        assert_eq!(resp.error.unwrap().code, -32700);

        client.send(r#"{"jsonrpc":"2.0","id":4,"params":{}}"#).await;
        let resp = client.recv().await;
        assert_eq!(resp.id, json!(4));
        assert_eq!(resp.error.unwrap().code, -32600);

        // Blank lines are skipped silently.
        client.send("").await;
        client
            .send(r#"{"jsonrpc":"2.0","id":5,"method":"initialize"}"#)
            .await;
        let resp = client.recv().await;
        assert_eq!(resp.id, json!(5));
        assert!(!resp.is_error());

        client.input.shutdown().await.unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_notifications_are_not_answered() {
        let fake = FakeHypervisor::new().with_domain("xeon", DomainState::Running);
        let (mut client, server) = start(&fake, std::future::pending());

        client
            .send(r#"{"jsonrpc":"2.0","method":"list_vms","params":{}}"#)
            .await;
        client
            .send(r#"{"jsonrpc":"2.0","id":2,"method":"list_vms","params":{}}"#)
            .await;
        client.input.shutdown().await.unwrap();

        let resp = client.recv().await;
        assert_eq!(resp.id, json!(2));
        // Nothing else follows.
        assert!(client.lines.next_line().await.unwrap().is_none());
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_eof_drains_in_flight_requests() {
        let fake = FakeHypervisor::new().with_domain("xeon", DomainState::Running);
        fake.set_delay(Duration::from_millis(50));
        let (mut client, server) = start(&fake, std::future::pending());

        client
            .send(r#"{"jsonrpc":"2.0","id":9,"method":"reboot_vm","params":{"name":"xeon"}}"#)
            .await;
        client.input.shutdown().await.unwrap();

        let resp = client.recv().await;
        assert_eq!(resp.id, json!(9));
        assert_eq!(resp.result.unwrap()["state"], "running");
        server.await.unwrap().unwrap();
        // Pool was closed on the way out.
        assert_eq!(fake.closed_sessions(), 1);
    }

    #[tokio::test]
    async fn test_eof_lets_queued_requests_run() {
        let fake = FakeHypervisor::new().with_domain("xeon", DomainState::Running);
        fake.set_delay(Duration::from_millis(20));
        let (mut client, server) = start(&fake, std::future::pending());

        // The second reboot waits on the first one's VM lock.
        client
            .send(r#"{"jsonrpc":"2.0","id":1,"method":"reboot_vm","params":{"name":"xeon"}}"#)
            .await;
        client
            .send(r#"{"jsonrpc":"2.0","id":2,"method":"reboot_vm","params":{"name":"xeon"}}"#)
            .await;
        client.input.shutdown().await.unwrap();

        let replies = client.recv_n(2).await;
        for id in ["1", "2"] {
            assert_eq!(replies[id].result.as_ref().unwrap()["state"], "running", "id {id}");
        }
        server.await.unwrap().unwrap();
        assert_eq!(fake.calls("reboot"), 2);
    }

    #[tokio::test]
    async fn test_oversized_line_is_rejected_and_reading_continues() {
        let fake = FakeHypervisor::new();
        let (mut client, server) = start(&fake, std::future::pending());

        let huge = vec![b'x'; LINE_LIMIT + 1024];
        client.input.write_all(&huge).await.unwrap();
        client
            .send("\n{\"jsonrpc\":\"2.0\",\"id\":5,\"method\":\"initialize\"}")
            .await;

        let resp = client.recv().await;
        assert_eq!(resp.id, Value::Null);
        assert_eq!(resp.error.unwrap().code, -32600);
        let resp = client.recv().await;
        assert_eq!(resp.id, json!(5));
        assert!(!resp.is_error());

        client.input.shutdown().await.unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unterminated_line_is_not_buffered_past_limit() {
        let (tx, rx) = tokio::io::duplex(64 * 1024);
        let mut reader = BufReader::new(rx);
        let mut buf = Vec::new();
        let mut discarding = false;

        let mut writer = tokio::spawn(async move {
            let mut tx = tx;
            let chunk = vec![b'a'; 64 * 1024];
            for _ in 0..(LINE_LIMIT / chunk.len() + 4) {
                tx.write_all(&chunk).await.unwrap();
            }
            tx
        });
        // No terminator has been sent, so the reader must still be waiting
        // once the writer has pushed everything.
        let mut tx = tokio::select! {
            read = next_line(&mut reader, &mut buf, &mut discarding) => {
                panic!("line ended early: {read:?}")
            }
            tx = &mut writer => tx.unwrap(),
        };
        assert!(buf.len() <= LINE_LIMIT);
        assert!(discarding);

        tx.write_all(b"\n{}\n").await.unwrap();
        let read = next_line(&mut reader, &mut buf, &mut discarding).await.unwrap();
        assert_eq!(read, Line::TooLong);
        assert!(buf.is_empty());
        let read = next_line(&mut reader, &mut buf, &mut discarding).await.unwrap();
        assert_eq!(read, Line::Complete);
        assert_eq!(buf, b"{}\n");
    }

    #[tokio::test]
    async fn test_final_line_without_terminator_is_served() {
        let mut input: &[u8] = b"{}\n[1]";
        let mut buf = Vec::new();
        let mut discarding = false;
        assert_eq!(next_line(&mut input, &mut buf, &mut discarding).await.unwrap(), Line::Complete);
        buf.clear();
        assert_eq!(next_line(&mut input, &mut buf, &mut discarding).await.unwrap(), Line::Complete);
        assert_eq!(buf, b"[1]");
        buf.clear();
        assert_eq!(next_line(&mut input, &mut buf, &mut discarding).await.unwrap(), Line::Eof);
    }

    #[tokio::test]
    async fn test_shutdown_signal_stops_reading() {
        let fake = FakeHypervisor::new();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let (mut client, server) = start(&fake, async {
            let _ = stop_rx.await;
        });

        client
            .send(r#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#)
            .await;
        assert_eq!(client.recv().await.id, json!(1));

        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("server should stop on signal")
            .unwrap()
            .unwrap();
    }
}
