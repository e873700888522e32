use bytes::Bytes;
use opencv::{
    core::{Point, Rect, Scalar, Vector},
    imgcodecs, imgproc,
};
use thiserror::Error;

use crate::camera::Frame;
use crate::detector::Detection;

#[derive(Error, Debug)]
pub enum AnnotateError {
    #[error("Failed to encode frame: {0}")]
    EncodeFrameFailed(opencv::Error),
    #[error("OpenCV error: {0}")]
    OpenCvError(opencv::Error),
}

impl From<opencv::Error> for AnnotateError {
    fn from(err: opencv::Error) -> Self {
        AnnotateError::OpenCvError(err)
    }
}

pub fn draw_detections(frame: &mut Frame, detections: &[Detection]) -> Result<(), AnnotateError> {
    for detection in detections {
        let x1 = detection.x1 as i32;
        let y1 = detection.y1 as i32;
        let x2 = detection.x2 as i32;
        let y2 = detection.y2 as i32;
        let label = format!("{}: {:.2}", detection.label, detection.confidence);

        // BGR
        let color = Scalar::new(0.0, 255.0, 0.0, 0.0);

        imgproc::rectangle(
            &mut frame.mat,
            Rect::new(x1, y1, x2 - x1, y2 - y1),
            color,
            2,
            imgproc::LINE_8,
            0,
        )?;

        imgproc::put_text(
            &mut frame.mat,
            &label,
            Point::new(x1, y1 - 5),
            imgproc::FONT_HERSHEY_SIMPLEX,
            0.5,
            color,
            1,
            imgproc::LINE_AA,
            false,
        )?;
    }
    Ok(())
}

pub fn encode_jpeg(frame: &Frame) -> Result<Bytes, AnnotateError> {
    let mut buf = Vector::<u8>::new();
    imgcodecs::imencode(".jpg", &frame.mat, &mut buf, &Vector::new())
        .map_err(AnnotateError::EncodeFrameFailed)?;
    Ok(Bytes::from(buf.to_vec()))
}
