use tokio::sync::mpsc;

/// First signal asks for a graceful drain, the second one for an
/// immediate exit.
#[derive(Debug, Clone, Copy)]
pub enum ShutdownEvent {
    Graceful,
    Immediate,
}

/// Watch for Ctrl-C (and SIGTERM on unix) and translate the first and
/// second occurrence into shutdown events.
pub fn spawn_signal_handler(tx: mpsc::UnboundedSender<ShutdownEvent>) {
    tokio::spawn(async move {
        let mut signals = 0u8;
        loop {
            if wait_for_signal().await.is_err() {
                return;
            }
            signals = signals.saturating_add(1);
            let event = if signals == 1 {
                ShutdownEvent::Graceful
            } else {
                ShutdownEvent::Immediate
            };
            if tx.send(event).is_err() || signals > 1 {
                return;
            }
        }
    });
}

async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut term =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res,
            _ = term.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}
