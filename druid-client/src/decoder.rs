//! Incremental decoding of streamed result arrays
//!
//! The broker answers a native query with one JSON array whose elements
//! arrive over time. [`ArrayDecoder`] finds element boundaries as bytes come
//! in, and [`RowStream`] drives it from the HTTP body: each poll hands out at
//! most one element and only reads from the network when nothing complete is
//! buffered.

use bytes::{Buf, Bytes, BytesMut};
use druid_core::{DruidError, DruidResult, ResultRow, RowExpander};
use futures::stream::{BoxStream, Stream, TryStreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::OwnedSemaphorePermit;
use tracing::debug;

use crate::metrics::ClientMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Waiting for the opening '['
    Start,
    /// After '[' (`first`) or after ','
    BeforeElement { first: bool },
    InElement(ElementKind),
    /// Waiting for ',' or ']'
    AfterElement,
    /// Closing ']' seen; only whitespace may follow
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ElementKind {
    Container,
    String,
    Scalar,
}

/// Splits a top-level JSON array into its elements without parsing them.
#[derive(Debug)]
pub struct ArrayDecoder {
    buf: BytesMut,
    pos: usize,
    state: State,
    element_start: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl Default for ArrayDecoder {
    fn default() -> Self {
        Self {
            buf: BytesMut::new(),
            pos: 0,
            state: State::Start,
            element_start: 0,
            depth: 0,
            in_string: false,
            escaped: false,
        }
    }
}

impl ArrayDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes received from the network
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Closing ']' has been seen
    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Bytes held but not yet handed out
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete element, or `None` if more input is needed
    pub fn next_element(&mut self) -> DruidResult<Option<Bytes>> {
        while self.pos < self.buf.len() {
            let byte = self.buf[self.pos];
            match self.state {
                State::Start => match byte {
                    b'[' => {
                        self.pos += 1;
                        self.state = State::BeforeElement { first: true };
                    }
                    b if is_whitespace(b) => self.pos += 1,
                    b => return Err(unexpected(b, "'[' at start of response")),
                },
                State::BeforeElement { first } => match byte {
                    b']' if first => {
                        self.pos += 1;
                        self.state = State::Done;
                    }
                    b']' | b',' => return Err(unexpected(byte, "a result element")),
                    b if is_whitespace(b) => self.pos += 1,
                    b => {
                        let kind = match b {
                            b'{' | b'[' => ElementKind::Container,
                            b'"' => ElementKind::String,
                            _ => ElementKind::Scalar,
                        };
                        self.element_start = self.pos;
                        self.depth = 0;
                        self.in_string = false;
                        self.escaped = false;
                        self.state = State::InElement(kind);
                    }
                },
                State::InElement(kind) => {
                    if let Some(end) = self.scan_element(kind) {
                        return Ok(Some(self.take_element(end)));
                    }
                }
                State::AfterElement => match byte {
                    b',' => {
                        self.pos += 1;
                        self.state = State::BeforeElement { first: false };
                    }
                    b']' => {
                        self.pos += 1;
                        self.state = State::Done;
                    }
                    b if is_whitespace(b) => self.pos += 1,
                    b => return Err(unexpected(b, "',' or ']' after a result element")),
                },
                State::Done => match byte {
                    b if is_whitespace(b) => self.pos += 1,
                    b => return Err(unexpected(b, "end of response after ']'")),
                },
            }
        }

        self.compact();
        Ok(None)
    }

    /// Check the input ended at a valid point
    pub fn finish(&self) -> DruidResult<()> {
        match self.state {
            State::Done => Ok(()),
            State::Start => Err(DruidError::decode("Empty response from broker")),
            _ => Err(DruidError::decode(
                "Response ended before the end of the result array",
            )),
        }
    }

    /// Advance through the current element. Returns its exclusive end once
    /// complete, `None` when the buffer runs out first.
    fn scan_element(&mut self, kind: ElementKind) -> Option<usize> {
        while self.pos < self.buf.len() {
            let byte = self.buf[self.pos];
            match kind {
                ElementKind::Container => {
                    self.pos += 1;
                    if self.in_string {
                        self.string_byte(byte);
                        continue;
                    }
                    match byte {
                        b'"' => self.in_string = true,
                        b'{' | b'[' => self.depth += 1,
                        b'}' | b']' => {
                            self.depth -= 1;
                            if self.depth == 0 {
                                return Some(self.pos);
                            }
                        }
                        _ => {}
                    }
                }
                ElementKind::String => {
                    self.pos += 1;
                    if self.pos - 1 == self.element_start {
                        self.in_string = true;
                        continue;
                    }
                    self.string_byte(byte);
                    if !self.in_string {
                        return Some(self.pos);
                    }
                }
                ElementKind::Scalar => {
                    if byte == b',' || byte == b']' || is_whitespace(byte) {
                        return Some(self.pos);
                    }
                    self.pos += 1;
                }
            }
        }
        None
    }

    fn string_byte(&mut self, byte: u8) {
        if self.escaped {
            self.escaped = false;
        } else if byte == b'\\' {
            self.escaped = true;
        } else if byte == b'"' {
            self.in_string = false;
        }
    }

    fn take_element(&mut self, end: usize) -> Bytes {
        let mut consumed = self.buf.split_to(end);
        let element = consumed.split_off(self.element_start).freeze();
        self.pos = 0;
        self.element_start = 0;
        self.state = State::AfterElement;
        element
    }

    /// Drop bytes that can no longer be part of an element
    fn compact(&mut self) {
        let keep_from = match self.state {
            State::InElement(_) => self.element_start,
            _ => self.pos,
        };
        self.buf.advance(keep_from);
        self.pos -= keep_from;
        self.element_start = 0;
    }
}

fn is_whitespace(byte: u8) -> bool {
    matches!(byte, b' ' | b'\n' | b'\r' | b'\t')
}

fn unexpected(byte: u8, expected: &str) -> DruidError {
    DruidError::decode(format!(
        "Unexpected byte {:?} in response, expected {}",
        char::from(byte),
        expected
    ))
}

/// Lazily decoded response: one `T` per top-level array element.
///
/// Dropping the stream before it ends abandons the response and releases
/// its connection.
pub struct RowStream<T> {
    body: BoxStream<'static, DruidResult<Bytes>>,
    permit: Option<OwnedSemaphorePermit>,
    decoder: ArrayDecoder,
    query_id: String,
    metrics: Arc<ClientMetrics>,
    started: Instant,
    elements_read: u64,
    finished: bool,
    _row: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> RowStream<T> {
    pub(crate) fn new(
        body: BoxStream<'static, DruidResult<Bytes>>,
        query_id: String,
        metrics: Arc<ClientMetrics>,
    ) -> Self {
        Self {
            body,
            permit: None,
            decoder: ArrayDecoder::new(),
            query_id,
            metrics,
            started: Instant::now(),
            elements_read: 0,
            finished: false,
            _row: PhantomData,
        }
    }

    /// Hold a connection slot until the stream ends, fails or is dropped
    pub(crate) fn with_permit(mut self, permit: OwnedSemaphorePermit) -> Self {
        self.permit = Some(permit);
        self
    }

    /// Id the broker tracks this query under
    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    /// Elements handed out so far
    pub fn elements_read(&self) -> u64 {
        self.elements_read
    }

    fn fail(&mut self, err: DruidError) -> Poll<Option<DruidResult<T>>> {
        self.finished = true;
        self.permit = None;
        self.metrics.record_error();
        debug!(query_id = %self.query_id, error = %err, "Response stream failed");
        Poll::Ready(Some(Err(err)))
    }
}

impl<T: DeserializeOwned> Stream for RowStream<T> {
    type Item = DruidResult<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        loop {
            match this.decoder.next_element() {
                Ok(Some(element)) => {
                    return match serde_json::from_slice::<T>(&element) {
                        Ok(row) => {
                            this.elements_read += 1;
                            this.metrics.record_element();
                            Poll::Ready(Some(Ok(row)))
                        }
                        Err(e) => this.fail(DruidError::decode(format!(
                            "Malformed result element {}: {}",
                            this.elements_read, e
                        ))),
                    };
                }
                Ok(None) => {}
                Err(err) => return this.fail(err),
            }

            match this.body.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.metrics.record_bytes(chunk.len());
                    this.decoder.feed(&chunk);
                }
                Poll::Ready(Some(Err(err))) => return this.fail(err),
                Poll::Ready(None) => {
                    if let Err(err) = this.decoder.finish() {
                        return this.fail(err);
                    }
                    this.finished = true;
                    this.permit = None;
                    this.metrics.record_completed(this.started.elapsed());
                    debug!(
                        query_id = %this.query_id,
                        elements = this.elements_read,
                        elapsed_ms = this.started.elapsed().as_millis() as u64,
                        "Response stream complete"
                    );
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<T> Drop for RowStream<T> {
    fn drop(&mut self) {
        if !self.finished {
            self.metrics.record_abandoned();
            debug!(
                query_id = %self.query_id,
                elements = self.elements_read,
                "Response stream abandoned before completion"
            );
        }
    }
}

/// Lazily decoded [`ResultRow`]s, unpacking select and scan envelopes.
pub struct ResultRows {
    elements: RowStream<Value>,
    expander: RowExpander,
    pending: VecDeque<ResultRow>,
    rows_read: u64,
}

impl ResultRows {
    pub(crate) fn new(elements: RowStream<Value>) -> Self {
        Self {
            elements,
            expander: RowExpander::new(),
            pending: VecDeque::new(),
            rows_read: 0,
        }
    }

    pub fn query_id(&self) -> &str {
        self.elements.query_id()
    }

    /// Rows handed out so far
    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }

    /// Select paging cursor as of the rows read so far
    pub fn paging_identifiers(&self) -> &BTreeMap<String, i64> {
        self.expander.paging_identifiers()
    }

    /// Read the remaining rows into memory
    pub async fn collect_rows(self) -> DruidResult<Vec<ResultRow>> {
        self.try_collect().await
    }
}

impl Stream for ResultRows {
    type Item = DruidResult<ResultRow>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if let Some(row) = this.pending.pop_front() {
                this.rows_read += 1;
                return Poll::Ready(Some(Ok(row)));
            }

            match Pin::new(&mut this.elements).poll_next(cx) {
                Poll::Ready(Some(Ok(element))) => match this.expander.expand(element) {
                    Ok(rows) => this.pending.extend(rows),
                    Err(err) => {
                        this.elements.finished = true;
                        this.elements.permit = None;
                        this.elements.metrics.record_error();
                        return Poll::Ready(Some(Err(err)));
                    }
                },
                Poll::Ready(Some(Err(err))) => return Poll::Ready(Some(Err(err))),
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
