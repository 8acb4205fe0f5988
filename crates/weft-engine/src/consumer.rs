//! The external caller of a root query.

use tokio::sync::mpsc;
use weft_reactive::ReactiveError;

/// Receives the answers of one root query.
///
/// Exactly one of `finished` or `exception` is called, after every answer.
pub trait ReasonerConsumer<P>: Send + 'static {
    fn receive_answer(&mut self, answer: P);

    fn finished(&mut self);

    fn exception(&mut self, error: ReactiveError);
}

/// Everything a [`ChannelConsumer`] forwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryEvent<P> {
    Answer(P),
    Finished,
    Exception(ReactiveError),
}

/// Forwards every callback into an unbounded channel.
pub struct ChannelConsumer<P> {
    tx: mpsc::UnboundedSender<QueryEvent<P>>,
}

impl<P> ChannelConsumer<P> {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<QueryEvent<P>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: QueryEvent<P>) {
        // The caller may stop listening at any time.
        let _ = self.tx.send(event);
    }
}

impl<P: Send + 'static> ReasonerConsumer<P> for ChannelConsumer<P> {
    fn receive_answer(&mut self, answer: P) {
        self.forward(QueryEvent::Answer(answer));
    }

    fn finished(&mut self) {
        self.forward(QueryEvent::Finished);
    }

    fn exception(&mut self, error: ReactiveError) {
        self.forward(QueryEvent::Exception(error));
    }
}
