//! The abstract message type and its encoding/decoding.
//!
//! The wire format, on-the-wire encoding of a message string, and any temp-file spillover for
//! large payloads are an external collaborator's concern (see spec §1's "deliberately out of
//! scope" list). This module defines only the trait boundary the engine needs to drive the
//! sender/receiver loops, plus the scratch-file handle the receiver owns across one parse cycle.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};

/// A single application message, ready to be placed into an outbound POST body.
///
/// Implementations are supplied by the application; this crate never constructs one itself
/// except via a registered [`Decoder`] for inbound messages.
pub trait Message: Send + Sync + fmt::Debug {
    /// The single-character type tag carried in the `t<i>`/`type` wire field.
    fn message_type(&self) -> char;

    /// The message's payload, encoded as a string suitable for `m<i>` (before percent-encoding).
    fn encode(&self) -> String;
}

/// Decodes the text payload of one `<message type="x">` element into a [`Message`].
///
/// Registered per type character with a [`DecoderRegistry`]. Given a reference to the
/// [`TempFileContext`] owned by the current receive cycle, so that a decoder for a message kind
/// whose payload is itself a pointer to out-of-band data can allocate scratch files that outlive
/// the parse but are cleaned up once the upward callback has run.
pub trait Decoder: Send + Sync {
    /// Decode `payload` (the message's inbound text content) into a [`Message`].
    ///
    /// A malformed or otherwise undecodable payload should be reported via
    /// [`Error::decode`](crate::Error::decode), the one public constructor this crate exposes;
    /// the engine treats it like every other `Kind::Decode` error — fatal, reported through the
    /// connection's error callback, then `close()`.
    fn decode(&self, payload: &str, temp_files: &TempFileContext) -> Result<Arc<dyn Message>>;
}

/// A registry mapping the single-character wire type tag to the [`Decoder`] responsible for it.
#[derive(Clone, Default)]
pub struct DecoderRegistry {
    decoders: HashMap<char, Arc<dyn Decoder>>,
}

impl DecoderRegistry {
    /// Creates an empty registry.
    pub fn new() -> DecoderRegistry {
        DecoderRegistry::default()
    }

    /// Registers `decoder` as responsible for messages tagged with `type_char`.
    pub fn register(&mut self, type_char: char, decoder: Arc<dyn Decoder>) {
        self.decoders.insert(type_char, decoder);
    }

    pub(crate) fn decode(
        &self,
        type_char: char,
        payload: &str,
        temp_files: &TempFileContext,
    ) -> Result<Arc<dyn Message>> {
        match self.decoders.get(&type_char) {
            Some(decoder) => decoder.decode(payload, temp_files),
            None => Err(Error::new_unknown_message_type(type_char)),
        }
    }
}

impl fmt::Debug for DecoderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecoderRegistry")
            .field("registered_types", &self.decoders.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// An owned scope for files that must outlive one XML parse but be released once the upward
/// `on_messages` callback has consumed the messages it produced.
///
/// Spec §9 describes this as a handle "passed into the decoder with deferred disposal hooked to
/// the callback's completion"; here that is realized as a lazily-created [`tempfile::TempDir`]
/// whose files are only actually materialized if a decoder asks for one.
pub struct TempFileContext {
    dir: std::sync::OnceLock<tempfile::TempDir>,
}

impl TempFileContext {
    pub(crate) fn new() -> TempFileContext {
        TempFileContext {
            dir: std::sync::OnceLock::new(),
        }
    }

    /// Creates a new temp file inside this context's scratch directory, allocating the
    /// directory itself on first use.
    pub fn new_temp_file(&self) -> std::io::Result<std::fs::File> {
        let dir = self.dir.get_or_init(|| {
            tempfile::tempdir().expect("failed to allocate temp-file scratch directory")
        });
        tempfile::tempfile_in(dir.path())
    }

    /// True once at least one temp file has been allocated through this context.
    pub(crate) fn is_used(&self) -> bool {
        self.dir.get().is_some()
    }
}

impl fmt::Debug for TempFileContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TempFileContext")
            .field("used", &self.is_used())
            .finish()
    }
}

// `TempFileContext` is disposed by simply dropping it: `tempfile::TempDir` removes its
// directory (and everything still in it) on drop.
