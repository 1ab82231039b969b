//src/node.rs

use anyhow::Result;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

use crate::pow::RawHeader;

pub type Send<T> = mpsc::UnboundedSender<T>;
type Recv<T> = mpsc::UnboundedReceiver<T>;

/// Handle through which completed blocks are pushed back upstream.
#[derive(Clone, Debug)]
pub struct NodeHandle {
    pub send: Send<Command>,
}

#[derive(Debug)]
pub enum Command {
    SubmitBlock(RawHeader),
}

impl NodeHandle {
    pub fn new() -> (Self, Recv<Command>) {
        let (send, recv) = mpsc::unbounded_channel();
        (NodeHandle { send }, recv)
    }

    pub fn submit_block(&self, header: RawHeader) -> bool {
        self.send.send(Command::SubmitBlock(header)).is_ok()
    }
}

#[derive(Debug)]
pub enum Message {
    Template(RawHeader),
    SubmitBlockResult(Option<Box<str>>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum FeedMessage {
    Template { block: FeedBlock },
    SubmitResult { error: Option<String> },
}

#[derive(Debug, Serialize, Deserialize)]
struct FeedBlock {
    header: RawHeader,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum FeedCommand {
    SubmitBlock { block: FeedBlock },
}

/// Decode one payload from the template channel.
pub fn decode_template(payload: &str) -> Result<Message> {
    let msg: FeedMessage = serde_json::from_str(payload)?;
    Ok(match msg {
        FeedMessage::Template { block } => Message::Template(block.header),
        FeedMessage::SubmitResult { error } => {
            Message::SubmitBlockResult(error.map(String::into_boxed_str))
        }
    })
}

struct ClientTask {
    addr: String,
    send_msg: Send<Message>,
    recv_cmd: Recv<Command>,
}

impl ClientTask {
    async fn run(mut self) {
        let mut backoff = 1u64;
        loop {
            let stream = match TcpStream::connect(&self.addr).await {
                Ok(s) => {
                    backoff = 1;
                    s
                }
                Err(e) => {
                    warn!("Template feed unreachable at {}: {e}", self.addr);
                    sleep(Duration::from_secs(backoff)).await;
                    backoff = (backoff * 2).min(30);
                    continue;
                }
            };
            debug!("Connected to template feed at {}", self.addr);

            let (reader, mut writer) = stream.into_split();
            let mut lines = BufReader::new(reader).lines();

            loop {
                tokio::select! {
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => match decode_template(&line) {
                            Ok(msg) => {
                                if self.send_msg.send(msg).is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                // a bad payload never disturbs cached state
                                warn!("Skipping malformed template payload: {e}");
                            }
                        },
                        Ok(None) => break,
                        Err(e) => {
                            warn!("Template feed read failed: {e}");
                            break;
                        }
                    },
                    cmd = self.recv_cmd.recv() => match cmd {
                        Some(Command::SubmitBlock(header)) => {
                            let cmd = FeedCommand::SubmitBlock { block: FeedBlock { header } };
                            let mut data = match serde_json::to_vec(&cmd) {
                                Ok(d) => d,
                                Err(e) => {
                                    warn!("Failed to encode block submission: {e}");
                                    continue;
                                }
                            };
                            data.push(b'\n');
                            if let Err(e) = writer.write_all(&data).await {
                                warn!("Failed to forward block submission: {e}");
                                break;
                            }
                        }
                        None => return,
                    },
                }
            }

            warn!("Template feed connection closed, reconnecting");
            sleep(Duration::from_secs(backoff)).await;
        }
    }
}

/// Upstream client: subscribes to the template channel and relays block
/// submissions. Messages surface on the returned receiver.
pub struct Client;

impl Client {
    pub fn new(addr: &str, recv_cmd: Recv<Command>) -> Recv<Message> {
        let (send_msg, recv_msg) = mpsc::unbounded_channel();
        let task = ClientTask { addr: addr.to_string(), send_msg, recv_cmd };
        tokio::spawn(task.run());
        recv_msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pow::tests::test_header;

    #[test]
    fn decodes_template_payload() {
        let payload = serde_json::json!({
            "type": "template",
            "block": { "header": test_header(777, 1_700_000_000_000u64) },
        });
        let msg = decode_template(&payload.to_string()).unwrap();
        match msg {
            Message::Template(header) => {
                assert_eq!(header.daa_score, 777);
                assert_eq!(header.timestamp, 1_700_000_000_000);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn decodes_submit_result() {
        let ok = decode_template(r#"{"type":"submitResult","error":null}"#).unwrap();
        assert!(matches!(ok, Message::SubmitBlockResult(None)));

        let rejected =
            decode_template(r#"{"type":"submitResult","error":"bad pow"}"#).unwrap();
        match rejected {
            Message::SubmitBlockResult(Some(e)) => assert_eq!(&*e, "bad pow"),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn malformed_payload_is_an_error() {
        assert!(decode_template("not json").is_err());
        assert!(decode_template(r#"{"type":"template","block":{}}"#).is_err());
    }
}
