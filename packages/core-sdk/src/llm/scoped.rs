use std::{
    pin::Pin,
    task::{Context, Poll},
};

use futures_util::Stream;

/**
 * \brief 带作用域的流句柄：无论正常结束、出错还是消费方提前放弃，
 *        底层流都只会被释放一次。
 */
pub struct ScopedStream<S> {
    label: &'static str,
    inner: Option<Pin<Box<S>>>,
}

impl<S: Stream> ScopedStream<S> {
    pub fn new(label: &'static str, inner: S) -> Self {
        tracing::debug!(stream = label, "stream handle opened");
        Self {
            label,
            inner: Some(Box::pin(inner)),
        }
    }
}

impl<S> ScopedStream<S> {
    fn release(&mut self) {
        if self.inner.take().is_some() {
            tracing::debug!(stream = self.label, "stream handle released");
        }
    }
}

impl<S: Stream> Stream for ScopedStream<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };
        match inner.as_mut().poll_next(cx) {
            Poll::Ready(None) => {
                this.release();
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

impl<S> Drop for ScopedStream<S> {
    fn drop(&mut self) {
        self.release();
    }
}
