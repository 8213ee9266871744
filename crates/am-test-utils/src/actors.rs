//! Sample actors used across the test suites.

use am_protocol::{ArgumentReader, Blob};
use am_runtime::{ActorHandle, InvocationContext, ValueStream};
use async_trait::async_trait;
use std::time::Duration;

/// Unary echo: `echo(s) -> "Echo: " + s`, plus a `ping` void method and a
/// `fail` method that always errors.
pub struct EchoActor;

#[async_trait]
impl ActorHandle for EchoActor {
    async fn invoke(
        &self,
        _ctx: &InvocationContext,
        method: &str,
        mut args: ArgumentReader,
    ) -> Result<Option<Blob>, String> {
        match method {
            "echo" => {
                let input: String = args.next_argument().map_err(|e| e.to_string())?;
                let encoded =
                    serde_json::to_vec(&format!("Echo: {input}")).map_err(|e| e.to_string())?;
                Ok(Some(Blob::new(encoded)))
            }
            "ping" => Ok(None),
            "fail" => Err("intentional failure".to_owned()),
            other => Err(format!("unknown method `{other}`")),
        }
    }
}

/// Streams a fixed payload sequence from its `watch` method, optionally
/// pacing items so tests can interrupt mid-stream.
pub struct SequenceActor {
    payloads: Vec<Vec<u8>>,
    delay: Option<Duration>,
}

impl SequenceActor {
    pub fn new(payloads: Vec<Vec<u8>>) -> Self {
        SequenceActor {
            payloads,
            delay: None,
        }
    }

    pub fn of_strs(items: &[&str]) -> Self {
        Self::new(items.iter().map(|s| s.as_bytes().to_vec()).collect())
    }

    pub fn paced(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl ActorHandle for SequenceActor {
    async fn invoke(
        &self,
        _ctx: &InvocationContext,
        method: &str,
        _args: ArgumentReader,
    ) -> Result<Option<Blob>, String> {
        Err(format!("unknown method `{method}`"))
    }

    fn open_stream(&self, method: &str) -> Result<ValueStream, String> {
        if method != "watch" {
            return Err(format!("method `{method}` is not a stream"));
        }
        let payloads = self.payloads.clone();
        let delay = self.delay;
        Ok(Box::pin(async_stream::stream! {
            for payload in payloads {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                yield Ok::<Vec<u8>, String>(payload);
            }
        }))
    }
}

/// Sleeps for the requested milliseconds, then returns; used by drain
/// tests to hold invocations in flight.
pub struct SleeperActor;

#[async_trait]
impl ActorHandle for SleeperActor {
    async fn invoke(
        &self,
        _ctx: &InvocationContext,
        method: &str,
        mut args: ArgumentReader,
    ) -> Result<Option<Blob>, String> {
        match method {
            "sleep" => {
                let millis: u64 = args.next_argument().map_err(|e| e.to_string())?;
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok(None)
            }
            other => Err(format!("unknown method `{other}`")),
        }
    }
}
