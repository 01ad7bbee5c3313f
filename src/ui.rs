use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::media::types::UiEvent;

/// Headless UI: writes the chat transcript and stream notices to the log.
/// Render-target requests are left unanswered, so video sinks open their own
/// windows.
pub(crate) fn start_console_ui(mut events: mpsc::UnboundedReceiver<UiEvent>, cancel: CancellationToken) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break;
                },
                event = events.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    show(event);
                },
            }
        }
    });
}

fn show(event: UiEvent) {
    match event {
        UiEvent::Chat(line) => log::info!("chat: {}", line),
        UiEvent::StreamFaulted {
            direction,
            kind,
            reason,
        } => log::error!("{} {} stream failed: {}", direction, kind, reason),
        UiEvent::StreamEnded { direction, kind } => {
            log::info!("{} {} stream ended", direction, kind)
        }
        UiEvent::RenderTargetRequested(request) => log::debug!(
            "{} {} sink wants a {} window, leaving it to the sink",
            request.direction,
            request.kind,
            request.surface
        ),
    }
}
