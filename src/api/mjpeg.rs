use std::convert::Infallible;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use futures_util::stream::{self, Stream};
use tokio::sync::watch;

use crate::buffer::FramePacket;

/// One `multipart/x-mixed-replace` part carrying a JPEG.
pub fn multipart_part(boundary: &str, jpeg: &[u8]) -> Bytes {
    let header = format!(
        "--{boundary}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        jpeg.len()
    );
    let mut part = BytesMut::with_capacity(header.len() + jpeg.len() + 2);
    part.put_slice(header.as_bytes());
    part.put_slice(jpeg);
    part.put_slice(b"\r\n");
    part.freeze()
}

pub fn content_type(boundary: &str) -> String {
    format!("multipart/x-mixed-replace; boundary={boundary}")
}

/// Per-client part stream.
///
/// Sends whatever is current, then waits for the next change. A client that
/// reads slowly skips intermediate frames; nothing queues up for it. While no
/// pipeline runs the placeholder is sent.
pub fn frame_stream(
    frames: watch::Receiver<Option<Arc<FramePacket>>>,
    placeholder: Bytes,
    boundary: Arc<str>,
) -> impl Stream<Item = Result<Bytes, Infallible>> {
    stream::unfold((frames, true), move |(mut frames, first)| {
        let placeholder = placeholder.clone();
        let boundary = Arc::clone(&boundary);
        async move {
            if !first && frames.changed().await.is_err() {
                return None;
            }
            let current = frames.borrow_and_update().clone();
            let part = match current {
                Some(packet) => multipart_part(&boundary, &packet.jpeg),
                None => multipart_part(&boundary, &placeholder),
            };
            Some((Ok(part), (frames, false)))
        }
    })
}
