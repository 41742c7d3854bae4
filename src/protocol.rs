// Copyright (c) The toreador Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The parent ⇄ worker message protocol.
//!
//! Messages travel as length-delimited JSON frames over the child's stdio
//! pipes. Framing errors are fatal to the worker; user errors never are --
//! they travel inside `testEnd` and `done` payloads as
//! [`SerializedError`]s.

use crate::{
    config::LoaderSnapshot,
    errors::ProtocolError,
    model::{Annotation, ArgMap, SerializedError, TestId, TestStatus},
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use camino::Utf8PathBuf;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

/// Upper bound on a single frame. Generous: the largest frames are captured
/// output chunks, which the worker already splits.
const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// Wraps a reader in the frame decoder.
pub(crate) fn framed_read<R: AsyncRead>(reader: R) -> FramedRead<R, LengthDelimitedCodec> {
    FramedRead::new(reader, codec())
}

/// Wraps a writer in the frame encoder.
pub(crate) fn framed_write<W: AsyncWrite>(writer: W) -> FramedWrite<W, LengthDelimitedCodec> {
    FramedWrite::new(writer, codec())
}

/// Sends one message as a JSON frame.
pub(crate) async fn send<W, T>(
    framed: &mut FramedWrite<W, LengthDelimitedCodec>,
    message: &T,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    use futures::SinkExt;
    let bytes = serde_json::to_vec(message)?;
    framed.send(Bytes::from(bytes)).await?;
    Ok(())
}

/// Receives the next message, or `None` on a cleanly closed channel.
pub(crate) async fn recv<R, T>(
    framed: &mut FramedRead<R, LengthDelimitedCodec>,
) -> Result<Option<T>, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    use futures::StreamExt;
    match framed.next().await {
        Some(frame) => {
            let frame = frame?;
            Ok(Some(serde_json::from_slice(&frame)?))
        }
        None => Ok(None),
    }
}

/// One schedulable entry of a bucket, as seen on the wire.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestEntry {
    /// The stable test id.
    pub test_id: TestId,
    /// The attempt number this entry runs as.
    pub retry: u32,
    /// The outcome that counts as success.
    pub expected_status: TestStatus,
    /// Whether the planner already decided this entry is skipped.
    pub skipped: bool,
    /// The per-attempt deadline.
    #[serde(with = "crate::config::duration_millis")]
    pub timeout: Duration,
}

/// Messages sent from the dispatcher to a worker.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ParentMessage {
    /// Sent exactly once, immediately after spawn.
    Init(InitMessage),
    /// Assigns a bucket of tests.
    Run(RunMessage),
    /// Requests a graceful shutdown.
    Stop {},
}

/// Payload of [`ParentMessage::Init`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitMessage {
    /// The worker slot index.
    pub worker_index: usize,
    /// The configuration snapshot the worker resolves projects from.
    pub loader: LoaderSnapshot,
    /// Names of environments the worker may need to resolve.
    pub fixture_files: Vec<String>,
}

/// Payload of [`ParentMessage::Run`]: one bucket.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMessage {
    /// The owning project's name.
    pub project: String,
    /// The test file to load.
    pub file: Utf8PathBuf,
    /// The entries to execute, in source order.
    pub entries: Vec<TestEntry>,
    /// The worker variation.
    pub variation: ArgMap,
    /// The canonical string form of the variation.
    pub variation_string: String,
    /// The repeat index shared by every entry in the bucket.
    pub repeat_each_index: u32,
}

/// Messages sent from a worker to the dispatcher.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum WorkerMessage {
    /// Initialization finished; the worker can accept `run` messages.
    Ready {},
    /// A test attempt started.
    #[serde(rename_all = "camelCase")]
    TestBegin {
        /// The test id.
        test_id: TestId,
        /// The worker slot index.
        worker_index: usize,
    },
    /// A captured stdout fragment.
    StdOut(StdioChunk),
    /// A captured stderr fragment.
    StdErr(StdioChunk),
    /// A test attempt finished.
    TestEnd(TestEndMessage),
    /// The current bucket is finished, or the worker is shutting down.
    Done(DoneMessage),
    /// An error escaped an `after_all` scope or environment teardown.
    TeardownError {
        /// The serialized error.
        error: SerializedError,
    },
}

/// A captured stdout/stderr fragment.
///
/// UTF-8 fragments travel as `text`; anything else as base64 `buffer`.
/// Fragments between a test's begin and end events carry that test's id.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StdioChunk {
    /// The test the fragment belongs to, if one was running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_id: Option<TestId>,
    /// The fragment as text, when it is valid UTF-8.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// The fragment as base64 bytes, otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buffer: Option<String>,
}

impl StdioChunk {
    /// Builds a chunk from raw captured bytes.
    pub fn from_bytes(test_id: Option<TestId>, bytes: &[u8]) -> Self {
        match std::str::from_utf8(bytes) {
            Ok(text) => Self {
                test_id,
                text: Some(text.to_owned()),
                buffer: None,
            },
            Err(_) => Self {
                test_id,
                text: None,
                buffer: Some(BASE64.encode(bytes)),
            },
        }
    }

    /// Recovers the fragment's bytes.
    pub fn bytes(&self) -> Vec<u8> {
        if let Some(text) = &self.text {
            text.as_bytes().to_vec()
        } else if let Some(buffer) = &self.buffer {
            BASE64.decode(buffer).unwrap_or_default()
        } else {
            Vec::new()
        }
    }
}

/// Payload of [`WorkerMessage::TestEnd`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestEndMessage {
    /// The test id.
    pub test_id: TestId,
    /// How long the attempt took.
    #[serde(with = "crate::config::duration_millis")]
    pub duration: Duration,
    /// The final status.
    pub status: TestStatus,
    /// The serialized error, for failed and timed-out attempts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<SerializedError>,
    /// User-attached data.
    #[serde(default)]
    pub data: ArgMap,
    /// The expected status, after dynamic modifiers.
    pub expected_status: TestStatus,
    /// Annotations effective for the attempt, including dynamic ones.
    #[serde(default)]
    pub annotations: Vec<Annotation>,
    /// The deadline the attempt ran under, after dynamic modifiers.
    #[serde(with = "crate::config::duration_millis")]
    pub timeout: Duration,
}

/// Payload of [`WorkerMessage::Done`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoneMessage {
    /// The last test whose outcome differed from its expected status, if
    /// any. The dispatcher uses this for retry accounting when `remaining`
    /// is non-empty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_test_id: Option<TestId>,
    /// A fatal error that prevented the bucket from running (e.g. the file
    /// failed to load, or a `before_all` scope collapsed).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fatal_error: Option<SerializedError>,
    /// Entries that were never executed.
    #[serde(default)]
    pub remaining: Vec<TestEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn frames_roundtrip_over_duplex() {
        let (client, server) = tokio::io::duplex(1024);
        let (server_read, _server_write) = tokio::io::split(server);
        let (_client_read, client_write) = tokio::io::split(client);

        let mut writer = framed_write(client_write);
        let mut reader = framed_read(server_read);

        let message = ParentMessage::Run(RunMessage {
            project: "default".to_owned(),
            file: Utf8PathBuf::from("tests/a.rs"),
            entries: vec![TestEntry {
                test_id: TestId("00aabbccddeeff11".to_owned()),
                retry: 1,
                expected_status: TestStatus::Passed,
                skipped: false,
                timeout: Duration::from_millis(1500),
            }],
            variation: ArgMap::new(),
            variation_string: "{}".to_owned(),
            repeat_each_index: 0,
        });
        send(&mut writer, &message).await.unwrap();
        send(&mut writer, &ParentMessage::Stop {}).await.unwrap();

        let first: ParentMessage = recv(&mut reader).await.unwrap().unwrap();
        match first {
            ParentMessage::Run(run) => {
                assert_eq!(run.project, "default");
                assert_eq!(run.entries.len(), 1);
                assert_eq!(run.entries[0].retry, 1);
                assert_eq!(run.entries[0].timeout, Duration::from_millis(1500));
            }
            other => panic!("expected run, got {other:?}"),
        }
        let second: ParentMessage = recv(&mut reader).await.unwrap().unwrap();
        assert!(matches!(second, ParentMessage::Stop {}));
    }

    #[test]
    fn message_kind_tags_are_stable() {
        let json = serde_json::to_value(WorkerMessage::TestBegin {
            test_id: TestId("0011223344556677".to_owned()),
            worker_index: 3,
        })
        .unwrap();
        assert_eq!(json["kind"], "testBegin");
        assert_eq!(json["testId"], "0011223344556677");
        assert_eq!(json["workerIndex"], 3);

        let json = serde_json::to_value(WorkerMessage::Done(DoneMessage::default())).unwrap();
        assert_eq!(json["kind"], "done");
        assert_eq!(json["remaining"], serde_json::json!([]));
    }

    #[test]
    fn stdio_chunk_prefers_text() {
        let chunk = StdioChunk::from_bytes(None, b"hello\n");
        assert_eq!(chunk.text.as_deref(), Some("hello\n"));
        assert!(chunk.buffer.is_none());
        assert_eq!(chunk.bytes(), b"hello\n");

        let chunk = StdioChunk::from_bytes(None, &[0xff, 0xfe, 0x00]);
        assert!(chunk.text.is_none());
        assert_eq!(chunk.bytes(), vec![0xff, 0xfe, 0x00]);
    }
}
