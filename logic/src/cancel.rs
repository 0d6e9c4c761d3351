use tokio::sync::watch;

/// One-shot cancellation signal: a single [`CancelHandle`] on the
/// controlling side, any number of cloned [`CancelToken`]s on the
/// listening side. Long-lived tasks (receive loop, maintenance) and
/// iterative lookups all take a token; firing the handle, or dropping
/// it, releases every listener.
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        CancelHandle(tx)
    }

    pub fn cancel(self) {
        // Listeners also treat a closed channel as cancelled, so a send
        // failure changes nothing
        let _ = self.0.send(true);
    }

    pub fn token(&self) -> CancelToken {
        CancelToken(State::Armed(self.0.subscribe()))
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
enum State {
    Never,
    Fired,
    Armed(watch::Receiver<bool>),
}

#[derive(Clone)]
pub struct CancelToken(State);

impl CancelToken {
    /// A token that never fires, for callers that don't need to abort.
    pub fn never() -> Self {
        CancelToken(State::Never)
    }

    /// Resolves once the handle fired (or was dropped); a fired token
    /// stays fired, awaiting it again resolves immediately.
    pub async fn cancelled(&mut self) {
        match &mut self.0 {
            State::Never => std::future::pending().await,
            State::Fired => {}
            State::Armed(rx) => {
                while !*rx.borrow() {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
                self.0 = State::Fired;
            }
        }
    }

    pub fn is_cancelled(&mut self) -> bool {
        match &mut self.0 {
            State::Never => false,
            State::Fired => true,
            State::Armed(rx) => {
                let fired = *rx.borrow() || rx.has_changed().is_err();
                if fired {
                    self.0 = State::Fired;
                }
                fired
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fires_on_cancel() {
        let handle = CancelHandle::new();
        let mut token = handle.token();
        assert!(!token.is_cancelled());
        handle.cancel();
        token.cancelled().await;
        // Fired state is sticky
        token.cancelled().await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn fires_on_drop() {
        let handle = CancelHandle::new();
        let mut token = handle.token();
        drop(handle);
        token.cancelled().await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn never_token_stays_pending() {
        let mut token = CancelToken::never();
        assert!(!token.is_cancelled());
        let pending = tokio::time::timeout(std::time::Duration::from_millis(10), token.cancelled());
        assert!(pending.await.is_err());
    }
}
