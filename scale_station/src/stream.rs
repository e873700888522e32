use bytes::Bytes;
use futures::stream;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::instrument;

use crate::state::SharedSnapshot;

const FRAME_BOUNDARY: &str = "frame";

#[derive(Clone)]
pub struct VideoStream {
    snapshot: SharedSnapshot,
    frame_delay_ms: u64,
}

#[derive(Error, Debug)]
pub enum VideoStreamError {
    #[error("Http builder error: {0}")]
    HttpBuilderError(String),
}

impl VideoStream {
    pub fn new(snapshot: SharedSnapshot, frame_delay_ms: u64) -> Self {
        Self {
            snapshot,
            frame_delay_ms,
        }
    }

    /// Multipart MJPEG from whatever frame the pipeline last published:
    /// live frames while scanning, the frozen frame while locked. Idle
    /// phases publish no frame, so the stream just waits.
    #[instrument(skip(self))]
    pub fn generate_stream(self) -> impl futures::Stream<Item = Result<Bytes, VideoStreamError>> {
        let frame_delay_ms = self.frame_delay_ms;

        stream::unfold(self.snapshot, move |snapshot| async move {
            loop {
                sleep(Duration::from_millis(frame_delay_ms)).await;
                let frame = snapshot.lock().frame.clone();
                if let Some(frame) = frame {
                    let part_header = format!(
                        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
                        FRAME_BOUNDARY,
                        frame.len()
                    );
                    let mut body = part_header.into_bytes();
                    body.extend_from_slice(&frame);
                    body.extend_from_slice(b"\r\n");
                    return Some((Ok::<_, VideoStreamError>(Bytes::from(body)), snapshot));
                }
            }
        })
    }
}
