use opencv::core::{Mat, Point, Rect, Scalar, Vector, CV_8UC3};
use opencv::imgcodecs;
use opencv::imgproc;
use opencv::prelude::*;

use super::aggregate::{MetricsSnapshot, TrafficState};
use super::object::ClassLabel;
use super::tracker::TrackedObject;

/// BGR colour per class.
fn class_color(class: ClassLabel) -> Scalar {
    match class {
        ClassLabel::Person => Scalar::new(0.0, 255.0, 0.0, 0.0),
        ClassLabel::Car => Scalar::new(255.0, 0.0, 0.0, 0.0),
        ClassLabel::Bus => Scalar::new(0.0, 165.0, 255.0, 0.0),
        ClassLabel::Truck => Scalar::new(0.0, 0.0, 255.0, 0.0),
        ClassLabel::Motorcycle => Scalar::new(255.0, 255.0, 0.0, 0.0),
        ClassLabel::Bicycle => Scalar::new(255.0, 0.0, 255.0, 0.0),
    }
}

fn state_color(state: TrafficState) -> Scalar {
    match state {
        TrafficState::Fluid => Scalar::new(0.0, 200.0, 0.0, 0.0),
        TrafficState::Moderate => Scalar::new(0.0, 200.0, 255.0, 0.0),
        TrafficState::Saturated => Scalar::new(0.0, 0.0, 255.0, 0.0),
    }
}

pub fn track_label(obj: &TrackedObject) -> String {
    format!(
        "{} {:.2} ID:{}",
        obj.class_label.as_str(),
        obj.confidence,
        obj.track_id
    )
}

/// Draws boxes for every visible track plus a traffic-state banner, in place.
pub fn draw(
    frame: &mut Mat,
    objects: &[TrackedObject],
    snapshot: &MetricsSnapshot,
) -> opencv::Result<()> {
    for obj in objects {
        let color = class_color(obj.class_label);
        let rect = Rect::new(
            obj.bbox.x as i32,
            obj.bbox.y as i32,
            obj.bbox.w.max(1.0) as i32,
            obj.bbox.h.max(1.0) as i32,
        );
        imgproc::rectangle(frame, rect, color, 2, imgproc::LINE_8, 0)?;
        imgproc::put_text(
            frame,
            &track_label(obj),
            Point::new(rect.x, (rect.y - 10).max(12)),
            imgproc::FONT_HERSHEY_SIMPLEX,
            0.5,
            color,
            2,
            imgproc::LINE_8,
            false,
        )?;
    }

    let banner = format!(
        "{} | frame {} | {:.1} fps",
        snapshot.traffic_state.as_str(),
        snapshot.frame,
        snapshot.fps
    );
    imgproc::put_text(
        frame,
        &banner,
        Point::new(10, 24),
        imgproc::FONT_HERSHEY_SIMPLEX,
        0.7,
        state_color(snapshot.traffic_state),
        2,
        imgproc::LINE_8,
        false,
    )?;

    Ok(())
}

pub fn encode_jpeg(frame: &Mat, quality: i32) -> opencv::Result<Vec<u8>> {
    let mut buf = Vector::<u8>::new();
    let params = Vector::<i32>::from_slice(&[imgcodecs::IMWRITE_JPEG_QUALITY, quality]);
    imgcodecs::imencode(".jpg", frame, &mut buf, &params)?;
    Ok(buf.to_vec())
}

/// Black frame served on `/video_feed` while no pipeline is running.
pub fn placeholder_jpeg(width: i32, height: i32, quality: i32) -> opencv::Result<Vec<u8>> {
    let mut frame =
        Mat::new_rows_cols_with_default(height, width, CV_8UC3, Scalar::all(0.0))?;
    imgproc::put_text(
        &mut frame,
        "no active source",
        Point::new(20, height / 2),
        imgproc::FONT_HERSHEY_SIMPLEX,
        0.8,
        Scalar::all(160.0),
        2,
        imgproc::LINE_8,
        false,
    )?;
    encode_jpeg(&frame, quality)
}
