//! Output resolution downscaling.

use image::imageops::{self, FilterType};
use image::{RgbImage, RgbaImage};
use mirror_platform::source::{Frame, PixelFormat};

/// Resizes a frame to `(width, height)`. Returns the input unchanged when it
/// already matches. BGRA frames are resized channel-wise, so the byte order
/// survives the round trip.
pub fn resize_frame(frame: Frame, width: u32, height: u32) -> Frame {
    if frame.width == width && frame.height == height {
        return frame;
    }

    let tight = tighten(&frame);
    match frame.format {
        PixelFormat::Rgb => {
            let Some(img) = RgbImage::from_raw(frame.width, frame.height, tight) else {
                return frame;
            };
            let resized = imageops::resize(&img, width, height, FilterType::Triangle);
            Frame::tight(width, height, PixelFormat::Rgb, resized.into_raw())
        }
        PixelFormat::Bgra => {
            let Some(img) = RgbaImage::from_raw(frame.width, frame.height, tight) else {
                return frame;
            };
            let resized = imageops::resize(&img, width, height, FilterType::Triangle);
            Frame::tight(width, height, PixelFormat::Bgra, resized.into_raw())
        }
    }
}

/// Copies the frame's pixel rows into a buffer without row padding.
pub fn tighten(frame: &Frame) -> Vec<u8> {
    let row_len = frame.width as usize * frame.format.bytes_per_pixel();
    if frame.stride as usize == row_len {
        return frame.data.to_vec();
    }
    let mut out = Vec::with_capacity(row_len * frame.height as usize);
    for y in 0..frame.height {
        out.extend_from_slice(frame.row(y));
    }
    out
}
