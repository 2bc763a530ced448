//! End-to-end tests for the RPC channel against small shell helpers

#![cfg(unix)]

use childrpc_transport::{
    ChannelError, Diagnostics, HandlerError, OutputSource, ProcessConfig, RecordingDiagnostics,
    RpcChannel, RpcMessage,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Replies `pong` to `ping`, ignores everything else
const PING_PONG_HELPER: &str = r#"
while IFS= read -r line; do
    if [ "$line" = '!RPC {"cmd":"ping"}' ]; then
        printf '%s\n' '!RPC {"cmd":"pong"}'
    fi
done
"#;

fn shell(script: &str) -> ProcessConfig {
    ProcessConfig::new("/bin/sh").with_arg("-c").with_arg(script)
}

/// A channel whose handler forwards every inbound message to the returned receiver
fn recording_channel(
    config: ProcessConfig,
) -> (
    RpcChannel,
    mpsc::UnboundedReceiver<RpcMessage>,
    Arc<RecordingDiagnostics>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let diagnostics = Arc::new(RecordingDiagnostics::new());

    let channel = RpcChannel::with_diagnostics(
        config,
        move |message: RpcMessage| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(message);
                Ok(None)
            }
        },
        Arc::clone(&diagnostics) as Arc<dyn Diagnostics>,
    );

    (channel, rx, diagnostics)
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<RpcMessage>) -> RpcMessage {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("handler channel closed")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ping_yields_single_pong() {
    let (channel, mut rx, diagnostics) = recording_channel(shell(PING_PONG_HELPER));
    channel.start(false).await.unwrap();

    channel.send_message(&json!({"cmd": "ping"})).await.unwrap();
    assert_eq!(recv(&mut rx).await, json!({"cmd": "pong"}));

    channel.supervisor().stdin().shutdown().await.unwrap();
    channel.join_readers().await.unwrap();

    assert!(rx.try_recv().is_err());
    assert!(diagnostics.lines().is_empty());
    channel.close().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_echoed_messages_keep_send_order() {
    let (channel, mut rx, diagnostics) = recording_channel(ProcessConfig::new("cat"));
    channel.start(false).await.unwrap();

    for seq in 0..50 {
        channel
            .send_message(&json!({"seq": seq, "text": "line\nbreak"}))
            .await
            .unwrap();
    }

    for seq in 0..50 {
        assert_eq!(
            recv(&mut rx).await,
            json!({"seq": seq, "text": "line\nbreak"})
        );
    }

    channel.shutdown().await.unwrap();
    assert!(diagnostics.lines().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_senders_never_interleave() {
    let (channel, mut rx, _diagnostics) = recording_channel(ProcessConfig::new("cat"));
    let channel = Arc::new(channel);
    channel.start(false).await.unwrap();

    let payload = "x".repeat(8192);
    let mut senders = Vec::new();
    for sender in 0..8 {
        let channel = Arc::clone(&channel);
        let payload = payload.clone();
        senders.push(tokio::spawn(async move {
            for seq in 0..25 {
                channel
                    .send(&json!({"sender": sender, "seq": seq, "payload": payload}))
                    .await
                    .unwrap();
            }
        }));
    }
    for sender in senders {
        sender.await.unwrap();
    }

    let mut next_seq = [0u64; 8];
    for _ in 0..200 {
        let message = recv(&mut rx).await;
        let sender = message["sender"].as_u64().unwrap() as usize;
        assert_eq!(message["seq"].as_u64().unwrap(), next_seq[sender]);
        assert_eq!(message["payload"].as_str().unwrap().len(), 8192);
        next_seq[sender] += 1;
    }

    channel.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_plain_stdout_goes_to_diagnostics() {
    let (channel, mut rx, diagnostics) = recording_channel(shell("printf 'hello world\\n'"));
    channel.start(false).await.unwrap();
    channel.join_readers().await.unwrap();

    assert_eq!(
        diagnostics.lines(),
        vec![(OutputSource::Stdout, "hello world".to_string())]
    );
    assert!(rx.try_recv().is_err());
    channel.close().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stderr_is_never_parsed() {
    let (channel, mut rx, diagnostics) =
        recording_channel(shell(r#"printf '%s\n' '!RPC {"cmd":"hidden"}' >&2"#));
    channel.start(false).await.unwrap();
    channel.join_readers().await.unwrap();

    assert_eq!(
        diagnostics.lines(),
        vec![(
            OutputSource::Stderr,
            r#"!RPC {"cmd":"hidden"}"#.to_string()
        )]
    );
    assert!(rx.try_recv().is_err());
    channel.close().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handler_reply_is_written_to_stdin() {
    // The helper announces itself, then reports whatever reply it gets on stderr
    let helper = r#"
printf '%s\n' '!RPC {"cmd":"hello"}'
IFS= read -r reply
printf '%s\n' "$reply" >&2
"#;
    let diagnostics = Arc::new(RecordingDiagnostics::new());
    let channel = RpcChannel::with_diagnostics(
        shell(helper),
        |message: RpcMessage| async move {
            assert_eq!(message, json!({"cmd": "hello"}));
            Ok(Some(json!({"cmd": "ack"})))
        },
        Arc::clone(&diagnostics) as Arc<dyn Diagnostics>,
    );

    channel.start(false).await.unwrap();
    channel.join_readers().await.unwrap();

    assert_eq!(
        diagnostics.lines_from(OutputSource::Stderr),
        vec![r#"!RPC {"cmd":"ack"}"#.to_string()]
    );
    channel.close().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_malformed_payload_ends_stdout_loop() {
    let (channel, mut rx, _diagnostics) =
        recording_channel(shell("printf '!RPC {oops\\n!RPC {}\\n'"));
    channel.start(false).await.unwrap();

    let err = channel.join_readers().await.unwrap_err();
    assert!(err.is_protocol_violation(), "unexpected error: {err}");
    assert!(rx.try_recv().is_err());
    channel.close().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handler_failure_ends_stdout_loop() {
    let channel = RpcChannel::new(
        shell(r#"printf '%s\n' '!RPC {"cmd":"explode"}'"#),
        |_message: RpcMessage| async move {
            Err::<Option<RpcMessage>, HandlerError>("cannot handle explode".into())
        },
    );
    channel.start(false).await.unwrap();

    let err = channel.join_readers().await.unwrap_err();
    assert!(matches!(err, ChannelError::Handler(_)));
    channel.close().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_send_after_shutdown_fails() {
    let (channel, _rx, _diagnostics) = recording_channel(ProcessConfig::new("cat"));
    channel.start(false).await.unwrap();
    channel.shutdown().await.unwrap();

    let err = channel.send_message(&json!({"late": true})).await.unwrap_err();
    assert!(matches!(err, ChannelError::Io(_)), "unexpected error: {err}");
}
