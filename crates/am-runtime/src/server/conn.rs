//! Per-connection session loop (server side).
//!
//! One task owns the frame link; it multiplexes inbound frames with the
//! connection's bounded outbound queue.  Invocations and publishers run as
//! spawned tasks that feed the queue, so a slow handler never stalls frame
//! intake, while the bounded queue keeps back-pressure on producers.
//!
//! A frame that fails to decode is logged and dropped — one bad message
//! must not kill the session.

use crate::link::FrameLink;
use crate::registry::InvocationContext;
use am_protocol::{
    decode_envelope, encode_envelope, ArgumentReader, Envelope, Invocation, Response,
    StreamEndReason, StreamError, StreamResume, StreamStart, PROTOCOL_VERSION_MAX,
    PROTOCOL_VERSION_MIN,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::publish::{run_publisher, ResumeAction};
use super::{Phase, ServerShared};

const OUTBOUND_QUEUE: usize = 64;

/// Error-string prefix for addressing failures; clients map it back to a
/// typed `actor-not-found`.
pub const ACTOR_NOT_FOUND_PREFIX: &str = "actor-not-found:";

pub(crate) async fn run_connection(
    mut link: Box<dyn FrameLink>,
    shared: Arc<ServerShared>,
    peer: String,
) {
    info!(peer = %peer, "connection established");
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_QUEUE);
    // Unsubscribe signals for streams opened on this connection.
    let mut streams: HashMap<Uuid, watch::Sender<bool>> = HashMap::new();
    let mut phase_rx = shared.phase_tx.subscribe();

    loop {
        tokio::select! {
            inbound = link.recv() => match inbound {
                None => break,
                Some(Err(e)) => {
                    debug!(peer = %peer, error = %e, "session error");
                    break;
                }
                Some(Ok(frame)) => {
                    // Handlers must never await the outbound queue from
                    // here: the queue only drains through this loop, so
                    // anything that writes frames runs as its own task.
                    handle_frame(frame, &shared, &out_tx, &mut streams, &peer).await;
                }
            },
            outbound = out_rx.recv() => {
                // The loop's own sender keeps the channel open, so this is
                // always `Some` while we run.
                if let Some(frame) = outbound {
                    if link.send(frame).await.is_err() {
                        break;
                    }
                }
            }
            _ = phase_rx.changed() => {
                // Draining still serves in-flight work; only a full stop
                // tears the session down.
                if *phase_rx.borrow() == Phase::Stopped {
                    break;
                }
            }
        }
    }

    // Responses queued by work that completed before the stop signal still
    // belong to the caller; flush them before closing.
    drop(out_tx);
    out_rx.close();
    while let Some(frame) = out_rx.recv().await {
        if link.send(frame).await.is_err() {
            break;
        }
    }
    link.shutdown().await;
    // Dropping the outbound queue makes live publishers park their replay
    // state for resume instead of sending terminators.
    info!(peer = %peer, "connection closed");
}

async fn handle_frame(
    frame: Vec<u8>,
    shared: &Arc<ServerShared>,
    out_tx: &mpsc::Sender<Vec<u8>>,
    streams: &mut HashMap<Uuid, watch::Sender<bool>>,
    peer: &str,
) {
    let envelope = match decode_envelope(&frame) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(peer = %peer, error = %e, "dropping undecodable frame");
            return;
        }
    };
    match envelope {
        Envelope::Invocation(invocation) => {
            spawn_invocation(invocation, shared, out_tx);
        }
        Envelope::StreamStart(start) => {
            start_stream(start, shared, out_tx, streams).await;
        }
        Envelope::StreamResume(resume) => {
            resume_stream(resume, shared, out_tx, streams).await;
        }
        Envelope::StreamEnd(end) if end.reason == StreamEndReason::ClientUnsubscribed => {
            match streams.get(&end.stream_id) {
                Some(unsub_tx) => {
                    let _ = unsub_tx.send(true);
                }
                None => debug!(stream_id = %end.stream_id, "unsubscribe for unknown stream"),
            }
        }
        other => {
            debug!(peer = %peer, frame = frame_name(&other), "ignoring unexpected frame");
        }
    }
}

fn frame_name(envelope: &Envelope) -> &'static str {
    match envelope {
        Envelope::Invocation(_) => "invocation",
        Envelope::Response(_) => "response",
        Envelope::StreamStart(_) => "streamStart",
        Envelope::StreamData(_) => "streamData",
        Envelope::StreamEnd(_) => "streamEnd",
        Envelope::StreamError(_) => "streamError",
        Envelope::StreamResume(_) => "streamResume",
    }
}

// ---------------------------------------------------------------------------
// Invocations
// ---------------------------------------------------------------------------

fn spawn_invocation(
    invocation: Invocation,
    shared: &Arc<ServerShared>,
    out_tx: &mpsc::Sender<Vec<u8>>,
) {
    // Count the invocation from arrival so drain sees it even before the
    // task gets scheduled.
    let inflight = shared.inflight.begin();
    let shared = Arc::clone(shared);
    let out_tx = out_tx.clone();
    tokio::spawn(async move {
        let _inflight = inflight;
        let call_id = invocation.call_id;
        let mut phase_rx = shared.phase_tx.subscribe();
        let response = tokio::select! {
            response = execute_invocation(invocation, &shared) => response,
            _ = wait_stopped(&mut phase_rx) => {
                debug!(call_id = %call_id, "invocation cancelled by shutdown");
                return;
            }
        };
        send_envelope(&out_tx, Envelope::Response(response), call_id).await;
    });
}

async fn execute_invocation(invocation: Invocation, shared: &ServerShared) -> Response {
    let call_id = invocation.call_id;
    if invocation.protocol_version < PROTOCOL_VERSION_MIN
        || invocation.protocol_version > PROTOCOL_VERSION_MAX
    {
        return Response::err(
            call_id,
            format!(
                "unsupported protocol version {}",
                invocation.protocol_version
            ),
        );
    }
    for gate in &shared.gates {
        if let Err(reason) = gate.check(&invocation).await {
            debug!(call_id = %call_id, reason = %reason, "invocation rejected by middleware");
            return Response::err(call_id, reason);
        }
    }
    shared.hooks.invocation(&invocation.target, &invocation.method);
    let Some(actor) = shared.registry.resolve(&invocation.target).await else {
        return Response::err(
            call_id,
            format!("{ACTOR_NOT_FOUND_PREFIX} {}", invocation.target),
        );
    };
    let ctx = InvocationContext {
        call_id,
        trace: invocation.trace_context.clone(),
    };
    match actor
        .invoke(&ctx, &invocation.method, ArgumentReader::new(invocation.arguments))
        .await
    {
        Ok(result) => Response::ok(call_id, result),
        Err(message) => Response::err(call_id, message),
    }
}

async fn wait_stopped(phase_rx: &mut watch::Receiver<Phase>) {
    loop {
        if *phase_rx.borrow() == Phase::Stopped {
            return;
        }
        if phase_rx.changed().await.is_err() {
            return;
        }
    }
}

async fn send_envelope(out_tx: &mpsc::Sender<Vec<u8>>, envelope: Envelope, call_id: Uuid) {
    match encode_envelope(&envelope) {
        Ok(bytes) => {
            let _ = out_tx.send(bytes).await;
        }
        Err(e) => {
            // A result that cannot be encoded still owes the caller an
            // answer on the same call ID.
            error!(call_id = %call_id, error = %e, "response encoding failed");
            if let Ok(bytes) = encode_envelope(&Envelope::Response(Response::err(
                call_id,
                format!("serialization failed: {e}"),
            ))) {
                let _ = out_tx.send(bytes).await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Streams
// ---------------------------------------------------------------------------

async fn start_stream(
    start: StreamStart,
    shared: &Arc<ServerShared>,
    out_tx: &mpsc::Sender<Vec<u8>>,
    streams: &mut HashMap<Uuid, watch::Sender<bool>>,
) {
    shared.hooks.stream_start(&start.actor_id, &start.method);
    let canonical = Uuid::new_v4();
    let (unsub_tx, unsub_rx) = watch::channel(false);
    streams.insert(canonical, unsub_tx);

    let shared = Arc::clone(shared);
    let out_tx = out_tx.clone();
    tokio::spawn(async move {
        let Some(actor) = shared.registry.resolve(&start.actor_id).await else {
            // The client still keys by its provisional ID; address the
            // error frame there so its consumer terminates.
            let frame = Envelope::StreamError(StreamError {
                stream_id: start.stream_id,
                message: format!("{ACTOR_NOT_FOUND_PREFIX} {}", start.actor_id),
            });
            if let Ok(bytes) = encode_envelope(&frame) {
                let _ = out_tx.send(bytes).await;
            }
            return;
        };

        shared.publishers.open(
            canonical,
            start.actor_id.clone(),
            start.method.clone(),
            start.filter.clone(),
            0,
        );

        // First frame of every stream: the canonical ID announcement the
        // client re-keys on.
        let reply = Envelope::StreamStart(StreamStart {
            stream_id: canonical,
            call_id: start.call_id,
            actor_id: start.actor_id.clone(),
            method: start.method.clone(),
            filter: start.filter.clone(),
        });
        match encode_envelope(&reply) {
            Ok(bytes) => {
                if out_tx.send(bytes).await.is_err() {
                    shared.publishers.finish(canonical);
                    return;
                }
            }
            Err(e) => {
                error!(stream_id = %canonical, error = %e, "stream start encoding failed");
                shared.publishers.finish(canonical);
                return;
            }
        }
        debug!(stream_id = %canonical, actor_id = %start.actor_id, method = %start.method, "stream opened");

        run_publisher(
            shared,
            actor,
            canonical,
            start.method,
            start.filter,
            0,
            out_tx,
            unsub_rx,
        )
        .await;
    });
}

async fn resume_stream(
    resume: StreamResume,
    shared: &Arc<ServerShared>,
    out_tx: &mpsc::Sender<Vec<u8>>,
    streams: &mut HashMap<Uuid, watch::Sender<bool>>,
) {
    let (replay, continue_from, filter) =
        match shared.publishers.resume(resume.stream_id, resume.last_seq) {
            ResumeAction::AlreadyActive => {
                debug!(stream_id = %resume.stream_id, "duplicate resume ignored");
                return;
            }
            ResumeAction::Replay {
                frames,
                continue_from,
                filter,
            } => {
                debug!(
                    stream_id = %resume.stream_id,
                    replayed = frames.len(),
                    continue_from,
                    "resuming from retained buffer"
                );
                (frames, continue_from, filter)
            }
            ResumeAction::Fresh => {
                // Nothing retained: restart from the current head.
                // Numbering continues from the client's checkpoint, so its
                // `seq > lastSequence` filter suppresses overlap and a
                // true gap stays detectable.
                debug!(
                    stream_id = %resume.stream_id,
                    last_seq = resume.last_seq,
                    "resume with no retained buffer; restarting"
                );
                shared.publishers.open(
                    resume.stream_id,
                    resume.actor_id.clone(),
                    resume.method.clone(),
                    None,
                    resume.last_seq,
                );
                (Vec::new(), resume.last_seq, None)
            }
        };

    let (unsub_tx, unsub_rx) = watch::channel(false);
    streams.insert(resume.stream_id, unsub_tx);

    let shared = Arc::clone(shared);
    let out_tx = out_tx.clone();
    tokio::spawn(async move {
        let stream_id = resume.stream_id;
        for frame in replay {
            match encode_envelope(&Envelope::StreamData(frame)) {
                Ok(bytes) => {
                    if out_tx.send(bytes).await.is_err() {
                        shared.publishers.park(stream_id);
                        return;
                    }
                }
                Err(e) => {
                    warn!(stream_id = %stream_id, error = %e, "replay encoding failed");
                }
            }
        }

        let Some(actor) = shared.registry.resolve(&resume.actor_id).await else {
            let frame = Envelope::StreamError(StreamError {
                stream_id,
                message: format!("{ACTOR_NOT_FOUND_PREFIX} {}", resume.actor_id),
            });
            if let Ok(bytes) = encode_envelope(&frame) {
                let _ = out_tx.send(bytes).await;
            }
            shared.publishers.finish(stream_id);
            return;
        };
        run_publisher(
            shared,
            actor,
            stream_id,
            resume.method,
            filter,
            continue_from,
            out_tx,
            unsub_rx,
        )
        .await;
    });
}
