use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use futures::Stream;
use tessera_artifact::{ByteStream, Error};

/// Passes a byte stream through while counting what went by.
///
/// With an expected length, a stream that runs long or ends short yields one
/// final error instead of finishing cleanly. The consumer's own failure path
/// (temp file removal, multipart abort, dropped request) then throws the
/// partial write away, so whatever was stored before stays untouched.
pub(crate) struct CountingStream {
  inner: ByteStream,
  tally: Arc<Tally>,
  expected: Option<u64>,
  finished: bool,
}

/// What a [`CountingStream`] saw, readable after the consumer is done.
#[derive(Debug, Default)]
pub(crate) struct Tally {
  seen: AtomicU64,
  mismatched: AtomicBool,
}

impl Tally {
  pub(crate) fn seen(&self) -> u64 {
    self.seen.load(Ordering::Relaxed)
  }

  /// True once the stream ran past or ended short of the expected length.
  pub(crate) fn mismatched(&self) -> bool {
    self.mismatched.load(Ordering::Relaxed)
  }
}

impl CountingStream {
  pub(crate) fn new(inner: ByteStream, expected: Option<u64>) -> (Self, Arc<Tally>) {
    let tally = Arc::new(Tally::default());
    (
      Self {
        inner,
        tally: tally.clone(),
        expected,
        finished: false,
      },
      tally,
    )
  }

  fn mismatch(&mut self, expected: u64, actual: u64) -> Poll<Option<Result<Bytes, Error>>> {
    self.finished = true;
    self.tally.mismatched.store(true, Ordering::Relaxed);
    Poll::Ready(Some(Err(Error::InvalidInput(format!(
      "declared {} bytes, received {}",
      expected, actual
    )))))
  }
}

impl Stream for CountingStream {
  type Item = Result<Bytes, Error>;

  fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    if self.finished {
      return Poll::Ready(None);
    }

    match ready!(self.inner.as_mut().poll_next(cx)) {
      Some(Ok(chunk)) => {
        let len = chunk.len() as u64;
        let seen = self.tally.seen.fetch_add(len, Ordering::Relaxed) + len;
        if let Some(expected) = self.expected
          && seen > expected
        {
          return self.mismatch(expected, seen);
        }
        Poll::Ready(Some(Ok(chunk)))
      }
      Some(Err(e)) => Poll::Ready(Some(Err(e))),
      None => {
        let seen = self.tally.seen();
        if let Some(expected) = self.expected
          && seen != expected
        {
          return self.mismatch(expected, seen);
        }
        self.finished = true;
        Poll::Ready(None)
      }
    }
  }

  fn size_hint(&self) -> (usize, Option<usize>) {
    self.inner.size_hint()
  }
}
