//! A [`Renderer`] living in another process, reached through length-prefixed
//! JSON frames on a pair of byte streams (typically the child's stdio).

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, error, info, warn};

use crate::dispatcher::{Renderer, ScriptCallback};
use crate::error::{Error, Result};
use crate::events::EventReceiver;
use crate::protocol::{
    EncodedFrame, HostEnvelope, RendererEnvelope, encode_host_envelope, eval_envelope,
    load_url_envelope, reader_loop, writer_loop,
};

type PendingTable = Arc<Mutex<HashMap<u64, ScriptCallback>>>;

pub struct FramedRenderer {
    tx: SyncSender<EncodedFrame>,
    pending: PendingTable,
    next_eval_id: AtomicU64,
    reader_handle: Option<JoinHandle<()>>,
    writer_handle: Option<JoinHandle<()>>,
}

impl FramedRenderer {
    /// Starts the reader and writer threads. Renderer events are routed into
    /// `receiver`; evaluation results resolve the matching pending callback.
    pub fn spawn<Rd, Wr>(
        reader: Rd,
        writer: Wr,
        receiver: EventReceiver,
        queue_cap: usize,
    ) -> Result<Self>
    where
        Rd: Read + Send + 'static,
        Wr: Write + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(queue_cap.max(1));
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));

        let writer_handle = thread::Builder::new()
            .name("reader-bridge-writer".to_string())
            .spawn(move || {
                if let Err(err) = writer_loop(writer, rx) {
                    error!("renderer writer terminated with error: {err}");
                }
            })?;

        let reader_pending = pending.clone();
        let reader_handle = thread::Builder::new()
            .name("reader-bridge-reader".to_string())
            .spawn(move || {
                let read_result = reader_loop(
                    reader,
                    |envelope| route_envelope(envelope, &reader_pending, &receiver),
                    |err| warn!("dropping malformed renderer frame: {err}"),
                );

                match read_result {
                    Ok(()) => info!("renderer closed its channel"),
                    Err(err) => error!("renderer reader terminated with error: {err}"),
                }

                // Whatever is still pending can no longer resolve.
                let abandoned = match reader_pending.lock() {
                    Ok(mut table) => table.drain().count(),
                    Err(_) => 0,
                };
                if abandoned > 0 {
                    debug!("{abandoned} script evaluation(s) left unresolved");
                }
            })?;

        Ok(Self {
            tx,
            pending,
            next_eval_id: AtomicU64::new(1),
            reader_handle: Some(reader_handle),
            writer_handle: Some(writer_handle),
        })
    }

    pub fn pending_evaluations(&self) -> usize {
        self.pending.lock().map(|table| table.len()).unwrap_or(0)
    }

    // Encoding on the caller's thread refuses oversized frames before they
    // reach the writer, whose only failure mode is ending the transport.
    fn send(&self, envelope: HostEnvelope) -> Result<()> {
        let frame = encode_host_envelope(&envelope)?;
        self.tx.send(frame).map_err(|_| Error::RendererClosed)
    }
}

impl Renderer for FramedRenderer {
    fn load_url(&self, url: &str) -> Result<()> {
        self.send(load_url_envelope(url))
    }

    fn evaluate_script(&self, script: &str, on_result: Option<ScriptCallback>) -> Result<()> {
        let id = self.next_eval_id.fetch_add(1, Ordering::Relaxed);
        let want_result = on_result.is_some();

        if let Some(callback) = on_result {
            if let Ok(mut table) = self.pending.lock() {
                table.insert(id, callback);
            }
        }

        let sent = self.send(eval_envelope(id, script, want_result));
        if sent.is_err() {
            if let Ok(mut table) = self.pending.lock() {
                table.remove(&id);
            }
        }
        sent
    }
}

impl Drop for FramedRenderer {
    fn drop(&mut self) {
        // Closing the queue ends the writer; the reader ends when the peer
        // closes its side, so it is only joined if it already finished.
        let (tx, _rx) = mpsc::sync_channel(1);
        drop(std::mem::replace(&mut self.tx, tx));

        if let Some(handle) = self.writer_handle.take() {
            if handle.join().is_err() {
                error!("renderer writer thread panicked");
            }
        }

        if let Some(handle) = self.reader_handle.take() {
            if handle.is_finished() {
                if handle.join().is_err() {
                    error!("renderer reader thread panicked");
                }
            } else {
                debug!("renderer reader still active during shutdown; skipping join");
            }
        }
    }
}

fn route_envelope(envelope: RendererEnvelope, pending: &PendingTable, receiver: &EventReceiver) {
    match envelope {
        RendererEnvelope::Ready => info!("renderer ready"),
        RendererEnvelope::EvalResult { id, result } => {
            let callback = match pending.lock() {
                Ok(mut table) => table.remove(&id),
                Err(_) => None,
            };
            match callback {
                Some(callback) => callback(result),
                None => debug!("ignoring result for unknown evaluation {id}"),
            }
        }
        RendererEnvelope::Event { name, arg } => receiver.dispatch(&name, arg.as_deref()),
    }
}
