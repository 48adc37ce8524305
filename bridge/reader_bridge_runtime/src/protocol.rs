//! Wire format between the host and an out-of-process renderer. Each frame is
//! a big-endian `u32` length followed by one JSON envelope.

use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use std::sync::mpsc::Receiver;

use crate::error::{Error, Result};

pub const HOST_TO_RENDERER_CAP: usize = 1_048_576;
pub const RENDERER_TO_HOST_CAP: usize = 1_048_576;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t")]
pub enum HostEnvelope {
    #[serde(rename = "load_url")]
    LoadUrl { url: String },
    #[serde(rename = "eval")]
    Eval {
        id: u64,
        script: String,
        want_result: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t")]
pub enum RendererEnvelope {
    #[serde(rename = "ready")]
    Ready,

    #[serde(rename = "eval_result")]
    EvalResult { id: u64, result: String },

    #[serde(rename = "event")]
    Event {
        name: String,
        #[serde(default)]
        arg: Option<String>,
    },
}

pub fn load_url_envelope(url: impl Into<String>) -> HostEnvelope {
    HostEnvelope::LoadUrl { url: url.into() }
}

pub fn eval_envelope(id: u64, script: impl Into<String>, want_result: bool) -> HostEnvelope {
    HostEnvelope::Eval {
        id,
        script: script.into(),
        want_result,
    }
}

/// A host envelope serialized once and known to fit the host-to-renderer cap,
/// ready to be queued for the writer thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame(Vec<u8>);

impl EncodedFrame {
    pub fn payload(&self) -> &[u8] {
        &self.0
    }

    pub fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        write_prefixed(writer, &self.0)
    }
}

pub fn encode_host_envelope(envelope: &HostEnvelope) -> Result<EncodedFrame> {
    encode_capped(envelope, HOST_TO_RENDERER_CAP).map(EncodedFrame)
}

pub fn decode_renderer_envelope(payload: &[u8]) -> Result<RendererEnvelope> {
    serde_json::from_slice(payload).map_err(|source| Error::Decode {
        what: "renderer envelope",
        source,
    })
}

/// Renderer side of the wire: the next host envelope, or `None` once the host
/// closed the stream between frames.
pub fn read_host_envelope(reader: &mut impl Read) -> Result<Option<HostEnvelope>> {
    let Some(payload) = read_payload(reader, HOST_TO_RENDERER_CAP)? else {
        return Ok(None);
    };
    serde_json::from_slice(&payload)
        .map(Some)
        .map_err(|source| Error::Decode {
            what: "host envelope",
            source,
        })
}

/// Renderer side of the wire: frames and writes one envelope for the host.
pub fn write_renderer_envelope(writer: &mut impl Write, envelope: &RendererEnvelope) -> Result<()> {
    let payload = encode_capped(envelope, RENDERER_TO_HOST_CAP)?;
    write_prefixed(writer, &payload)?;
    writer.flush()?;
    Ok(())
}

pub fn writer_loop<W: Write>(mut writer: W, rx: Receiver<EncodedFrame>) -> io::Result<()> {
    for frame in rx {
        frame.write_to(&mut writer)?;
        writer.flush()?;
    }

    Ok(())
}

/// Reads renderer envelopes until the stream ends between two frames.
/// Frames whose JSON does not decode are handed to `on_malformed` and skipped;
/// a stream cut off inside a frame or an oversized length is an error.
pub fn reader_loop<R, F, M>(mut reader: R, mut on_envelope: F, mut on_malformed: M) -> Result<()>
where
    R: Read,
    F: FnMut(RendererEnvelope),
    M: FnMut(Error),
{
    while let Some(payload) = read_payload(&mut reader, RENDERER_TO_HOST_CAP)? {
        match decode_renderer_envelope(&payload) {
            Ok(envelope) => on_envelope(envelope),
            Err(err) => on_malformed(err),
        }
    }

    Ok(())
}

fn encode_capped<T: Serialize>(value: &T, cap: usize) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(value).map_err(Error::Encode)?;
    if payload.len() > cap {
        return Err(Error::FrameTooLarge {
            len: payload.len(),
            cap,
        });
    }
    Ok(payload)
}

// Callers cap payloads at 1 MiB, well inside the u32 prefix.
fn write_prefixed(writer: &mut impl Write, payload: &[u8]) -> io::Result<()> {
    writer.write_all(&(payload.len() as u32).to_be_bytes())?;
    writer.write_all(payload)
}

fn read_payload(reader: &mut impl Read, cap: usize) -> Result<Option<Vec<u8>>> {
    let mut prefix = [0_u8; 4];
    let mut filled = 0;
    while filled < prefix.len() {
        match reader.read(&mut prefix[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len > cap {
        return Err(Error::FrameTooLarge { len, cap });
    }

    let mut payload = vec![0_u8; len];
    reader.read_exact(&mut payload)?;
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::io::Cursor;

    fn renderer_wire(envelopes: &[RendererEnvelope]) -> Vec<u8> {
        let mut wire = Vec::new();
        for envelope in envelopes {
            write_renderer_envelope(&mut wire, envelope).expect("write envelope");
        }
        wire
    }

    #[test]
    fn load_url_frame_carries_its_length_big_endian() {
        let frame = encode_host_envelope(&load_url_envelope("http://localhost:8080/?url=a.epub"))
            .expect("encode");

        let mut out = Vec::new();
        frame.write_to(&mut out).expect("write");

        let len = frame.payload().len();
        assert_eq!(out[..4], (len as u32).to_be_bytes());
        assert_eq!(&out[4..], frame.payload());
        let value: Value = serde_json::from_slice(frame.payload()).expect("json");
        assert_eq!(value["t"], "load_url");
        assert_eq!(value["url"], "http://localhost:8080/?url=a.epub");
    }

    #[test]
    fn oversized_eval_is_refused_at_encode_time() {
        let script = format!("setTheme({{\"css\":\"{}\"}})", "a".repeat(HOST_TO_RENDERER_CAP));
        let err = encode_host_envelope(&eval_envelope(1, script, false)).expect_err("too large");
        assert!(matches!(
            err,
            Error::FrameTooLarge { len, cap: HOST_TO_RENDERER_CAP } if len > HOST_TO_RENDERER_CAP
        ));
    }

    #[test]
    fn relocation_event_cut_off_mid_frame_is_an_error() {
        let mut wire = renderer_wire(&[RendererEnvelope::Event {
            name: "onRelocated".to_string(),
            arg: Some(r#"{"fraction":0.25}"#.to_string()),
        }]);
        wire.truncate(wire.len() - 3);

        let mut seen = 0;
        let err = reader_loop(Cursor::new(wire), |_| seen += 1, |_| {}).expect_err("truncated");
        assert!(matches!(err, Error::Io(ref source) if source.kind() == io::ErrorKind::UnexpectedEof));
        assert_eq!(seen, 0);
    }

    #[test]
    fn oversized_renderer_length_is_rejected() {
        let len = (RENDERER_TO_HOST_CAP as u32) + 1;
        let err = reader_loop(Cursor::new(len.to_be_bytes().to_vec()), |_| {}, |_| {})
            .expect_err("too large");
        assert!(matches!(err, Error::FrameTooLarge { cap: RENDERER_TO_HOST_CAP, .. }));
    }

    #[test]
    fn decodes_event_with_and_without_arg() {
        let decoded = decode_renderer_envelope(
            br#"{"t":"event","name":"onRelocated","arg":"{\"fraction\":0.5}"}"#,
        )
        .expect("decode event");
        assert_eq!(
            decoded,
            RendererEnvelope::Event {
                name: "onRelocated".to_string(),
                arg: Some(r#"{"fraction":0.5}"#.to_string()),
            }
        );

        let decoded = decode_renderer_envelope(br#"{"t":"event","name":"onSelectionEnd"}"#)
            .expect("decode event");
        assert_eq!(
            decoded,
            RendererEnvelope::Event {
                name: "onSelectionEnd".to_string(),
                arg: None,
            }
        );
    }

    #[test]
    fn decodes_eval_result_keeping_raw_quotes() {
        let decoded = decode_renderer_envelope(br#"{"t":"eval_result","id":4,"result":"\"paginated\""}"#)
            .expect("decode result");
        assert_eq!(
            decoded,
            RendererEnvelope::EvalResult {
                id: 4,
                result: "\"paginated\"".to_string(),
            }
        );
    }

    #[test]
    fn reader_loop_skips_malformed_frames_and_stops_between_frames() {
        let mut wire = renderer_wire(&[RendererEnvelope::Ready]);
        let bogus = br#"{"t":"bogus"}"#;
        wire.extend_from_slice(&(bogus.len() as u32).to_be_bytes());
        wire.extend_from_slice(bogus);
        wire.extend(renderer_wire(&[RendererEnvelope::EvalResult {
            id: 1,
            result: "\"scrolled\"".to_string(),
        }]));

        let mut seen = Vec::new();
        let mut malformed = Vec::new();
        reader_loop(Cursor::new(wire), |env| seen.push(env), |err| malformed.push(err))
            .expect("clean end of stream");

        assert_eq!(
            seen,
            vec![
                RendererEnvelope::Ready,
                RendererEnvelope::EvalResult {
                    id: 1,
                    result: "\"scrolled\"".to_string(),
                },
            ]
        );
        assert_eq!(malformed.len(), 1);
        assert!(matches!(malformed[0], Error::Decode { what: "renderer envelope", .. }));
    }

    #[test]
    fn writer_loop_output_reads_back_as_host_envelopes() {
        let (tx, rx) = std::sync::mpsc::channel();
        for envelope in [
            load_url_envelope("https://reader/?url=x"),
            eval_envelope(1, "next()", false),
            eval_envelope(2, "getTheme()", true),
        ] {
            tx.send(encode_host_envelope(&envelope).expect("encode")).expect("queue");
        }
        drop(tx);

        let mut out = Vec::new();
        writer_loop(&mut out, rx).expect("write all");

        let mut cursor = Cursor::new(out);
        let mut read = || read_host_envelope(&mut cursor).expect("read");
        assert_eq!(read(), Some(load_url_envelope("https://reader/?url=x")));
        assert_eq!(read(), Some(eval_envelope(1, "next()", false)));
        assert_eq!(read(), Some(eval_envelope(2, "getTheme()", true)));
        assert_eq!(read(), None);
    }
}
