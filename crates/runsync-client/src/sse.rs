use async_stream::stream;
use futures_util::StreamExt;
use reqwest_eventsource::{Error as SseError, Event, EventSource, retry};
use runsync_protocol::{ChannelSignal, ChannelStream, EventFrame};
use tracing::{debug, warn};

const DEFAULT_EVENT_NAME: &str = "message";

/// Open an SSE channel for `request`.
///
/// Reconnection belongs to the engine, so the event source never retries on
/// its own: the first error ends the channel with a single `Failed` signal.
pub(crate) fn open_channel(request: reqwest::RequestBuilder, origin: String) -> ChannelStream {
    let mut source = match EventSource::new(request) {
        Ok(source) => source,
        Err(error) => return failed(format!("cannot open event stream: {error}")),
    };
    source.set_retry_policy(Box::new(retry::Never));

    stream! {
        while let Some(next) = source.next().await {
            match next {
                Ok(Event::Open) => {
                    debug!(%origin, "event stream open");
                    yield ChannelSignal::Opened;
                }
                Ok(Event::Message(message)) => {
                    yield ChannelSignal::Frame(frame_of(message.event, message.data, message.id));
                }
                Err(error) => {
                    source.close();
                    let reason = describe(&error, &origin);
                    warn!(%reason, "event stream failed");
                    yield ChannelSignal::Failed(reason);
                    break;
                }
            }
        }
    }
    .boxed()
}

/// A channel that fails immediately.
pub(crate) fn failed(reason: String) -> ChannelStream {
    futures_util::stream::once(async move { ChannelSignal::Failed(reason) }).boxed()
}

fn frame_of(name: String, data: String, id: String) -> EventFrame {
    let name = if name == DEFAULT_EVENT_NAME {
        String::new()
    } else {
        name
    };
    EventFrame {
        name,
        data,
        last_event_id: (!id.is_empty()).then_some(id),
    }
}

fn describe(error: &SseError, origin: &str) -> String {
    match error {
        SseError::InvalidStatusCode(status, _) => {
            format!("event stream rejected: HTTP {} ({origin})", status.as_u16())
        }
        SseError::InvalidContentType(content_type, _) => format!(
            "event stream has unexpected content type {:?} ({origin})",
            content_type
        ),
        SseError::StreamEnded => format!("event stream ended ({origin})"),
        other => format!("event stream error: {other} ({origin})"),
    }
}
